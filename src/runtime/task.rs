//! 任务定义模块
//!
//! 运行时里的每个任务（REST 服务、RPC 服务、事件订阅、用户任务）都实现 [`Task`]。
//! 所有任务共用同一个取消令牌，令牌被触发时任务应尽快退出。

use crate::error::Result;
use crate::pubsub::{EventHandler, MessageBus};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 任务执行结果
pub type TaskResult = Result<()>;

/// 任务 Future
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// 任务 trait
pub trait Task: Send {
    /// 获取任务名称
    fn name(&self) -> &str;

    /// 运行任务
    ///
    /// # 参数
    /// * `cancel` - 共享的取消令牌，被触发时任务应该优雅退出
    fn run(self: Box<Self>, cancel: CancellationToken) -> TaskFuture;
}

// -------- Spawn Task --------

/// Spawn 任务
///
/// 包装一个 Future，或一个接收取消令牌、返回 Future 的闭包
pub struct SpawnTask {
    name: String,
    future_fn: Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send + 'static>,
}

impl SpawnTask {
    /// 创建不关心取消令牌的任务
    pub fn new<Fut>(name: impl Into<String>, future: Fut) -> Self
    where
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            future_fn: Box::new(move |_cancel| Box::pin(future)),
        }
    }

    /// 创建需要取消令牌的任务
    ///
    /// # 示例
    /// ```rust,no_run
    /// use compass_service_core::runtime::task::SpawnTask;
    ///
    /// let task = SpawnTask::with_shutdown("ticker", |cancel| async move {
    ///     cancel.cancelled().await;
    ///     Ok(())
    /// });
    /// ```
    pub fn with_shutdown<F, Fut>(name: impl Into<String>, future_fn: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            future_fn: Box::new(move |cancel| Box::pin(future_fn(cancel))),
        }
    }
}

impl Task for SpawnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, cancel: CancellationToken) -> TaskFuture {
        (self.future_fn)(cancel)
    }
}

// -------- Subscription Task --------

/// 事件订阅任务
///
/// 在总线上订阅一个 topic，取消令牌被触发时订阅返回 `Ok(())`
pub struct SubscriptionTask {
    name: String,
    topic: String,
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn EventHandler>,
}

impl SubscriptionTask {
    pub fn new(
        topic: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let topic = topic.into();
        Self {
            name: format!("subscribe:{}", topic),
            topic,
            bus,
            handler,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Task for SubscriptionTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, cancel: CancellationToken) -> TaskFuture {
        let SubscriptionTask {
            topic, bus, handler, ..
        } = *self;
        Box::pin(async move { bus.subscribe(cancel, &topic, handler).await })
    }
}
