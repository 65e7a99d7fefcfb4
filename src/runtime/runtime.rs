//! 微服务运行时实现
//!
//! 托管一个 [`CloudService`] 的完整生命周期：
//! - 初始化
//! - 为 REST、RPC 和每个事件订阅启动任务
//! - 监听停机信号
//! - 优雅停机，超时后强制中止

use std::future::Future;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RestConfig, RpcConfig, ServiceConfig};
use crate::error::{Result, ServiceError};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::signal::{watch_shutdown, ShutdownSignal};
use crate::runtime::task::{SpawnTask, SubscriptionTask, Task, TaskResult};
use crate::service::{CloudService, RestServer, RpcServer};

/// 运行时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Initializing,
    Serving,
    ShuttingDown,
    Stopped,
}

/// 微服务运行时
///
/// # 使用示例
///
/// ```rust,no_run
/// use axum::{routing::get, Router};
/// use compass_service_core::runtime::ServiceRuntime;
/// use compass_service_core::service::BaseService;
///
/// # async fn example() {
/// let service = BaseService::new()
///     .register_rest(Router::new().route("/ping", get(|| async { "pong" })));
///
/// ServiceRuntime::new("locations").start(service).await;
/// # }
/// ```
///
/// 任一任务失败都会触发全部任务停止，[`run`](Self::run) 返回第一个错误。
pub struct ServiceRuntime {
    service_name: String,
    config: RuntimeConfig,
    rest: RestConfig,
    rpc: RpcConfig,
    tasks: Vec<Box<dyn Task>>,
    shutdown_signal: Option<ShutdownSignal>,
    cancel: CancellationToken,
    state: watch::Sender<RuntimeState>,
}

impl ServiceRuntime {
    /// 创建新的服务运行时
    pub fn new(service_name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(RuntimeState::Initializing);
        Self {
            service_name: service_name.into(),
            config: RuntimeConfig::default(),
            rest: RestConfig::default(),
            rpc: RpcConfig::default(),
            tasks: Vec::new(),
            shutdown_signal: None,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// 从服务配置创建运行时
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.service_name.clone())
            .with_config(config.runtime.clone())
            .with_rest_config(config.rest.clone())
            .with_rpc_config(config.rpc.clone())
    }

    /// 设置运行时配置
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rest_config(mut self, rest: RestConfig) -> Self {
        self.rest = rest;
        self
    }

    pub fn with_rpc_config(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    /// 额外的停机信号，完成时与收到 SIGINT/SIGTERM 效果相同
    pub fn with_shutdown_signal<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown_signal = Some(Box::pin(signal));
        self
    }

    /// 添加任务
    pub fn add_task(mut self, task: Box<dyn Task>) -> Self {
        info!(task_name = %task.name(), "Adding task to runtime");
        self.tasks.push(task);
        self
    }

    /// 添加 spawn 任务（需要取消令牌）
    ///
    /// # 示例
    /// ```rust,no_run
    /// use compass_service_core::runtime::ServiceRuntime;
    ///
    /// let runtime = ServiceRuntime::new("my-service")
    ///     .add_spawn_with_shutdown("cleanup", |cancel| async move {
    ///         cancel.cancelled().await;
    ///         Ok(())
    ///     });
    /// ```
    pub fn add_spawn_with_shutdown<F, Fut>(self, name: impl Into<String>, future_fn: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.add_task(Box::new(SpawnTask::with_shutdown(name, future_fn)))
    }

    /// 订阅状态变化
    pub fn state(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// 所有任务共用的取消令牌，触发它等同于收到停机信号
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.send_replace(state);
        info!(service_name = %self.service_name, state = ?state, "Runtime state changed");
    }

    /// 运行服务，出错时记录日志并以状态码 1 退出进程
    pub async fn start<S: CloudService>(self, service: S) {
        let service_name = self.service_name.clone();
        if let Err(e) = self.run(service).await {
            error!(service_name = %service_name, error = %e, "❌ Service stopped with error");
            std::process::exit(1);
        }
    }

    /// 运行服务直到停机
    ///
    /// 执行以下步骤：
    /// 1. 调用 `init`
    /// 2. 为服务暴露的每种能力启动任务
    /// 3. 等待停机信号或第一个任务失败
    /// 4. 取消所有任务并等待它们退出，超过 `shutdown_timeout` 后强制中止
    ///
    /// 由信号触发或所有任务正常结束时返回 `Ok(())`，否则返回第一个错误。
    pub async fn run<S: CloudService>(mut self, mut service: S) -> Result<()> {
        info!(service_name = %self.service_name, "🚀 Starting service runtime");
        self.set_state(RuntimeState::Initializing);

        if let Err(e) = service.init(&self.cancel).await {
            error!(service_name = %self.service_name, error = %e, "❌ Service init failed");
            self.set_state(RuntimeState::Stopped);
            return Err(ServiceError::Init(e));
        }

        let mut tasks = std::mem::take(&mut self.tasks);
        match self.plan(&service) {
            Ok(planned) => tasks.extend(planned),
            Err(e) => {
                error!(service_name = %self.service_name, error = %e, "❌ Service cannot be served");
                self.set_state(RuntimeState::Stopped);
                return Err(e);
            }
        }

        self.set_state(RuntimeState::Serving);
        let mut join_set = self.start_tasks(tasks);
        let signal_task = tokio::spawn(watch_shutdown(
            self.cancel.clone(),
            self.shutdown_signal.take(),
            self.config.handle_os_signals,
        ));

        let mut first_error = None;
        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(joined) => Self::record(&self.cancel, &mut first_error, joined),
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }

        self.set_state(RuntimeState::ShuttingDown);
        self.cancel.cancel();
        Self::wait_for_tasks_shutdown(&self.config, &self.cancel, &mut join_set, &mut first_error)
            .await;
        signal_task.abort();

        self.set_state(RuntimeState::Stopped);
        drop(service);
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(service_name = %self.service_name, "Service runtime stopped");
                Ok(())
            }
        }
    }

    /// 根据服务暴露的能力生成任务
    fn plan<S: CloudService>(&self, service: &S) -> Result<Vec<Box<dyn Task>>> {
        let mut tasks = Vec::new();

        if let Some(router) = service.rest() {
            tasks.extend(RestServer::new(self.rest.clone(), router).into_tasks());
        }
        if let Some(routes) = service.rpc() {
            tasks.extend(RpcServer::new(self.rpc.clone(), routes).into_tasks());
        }
        if let Some(events) = service.events() {
            let bus = service
                .bus()
                .ok_or_else(|| ServiceError::Unexpected("message bus not initialized".into()))?;
            for (topic, handler) in events {
                tasks.push(Box::new(SubscriptionTask::new(topic, bus.clone(), handler)));
            }
        }

        Ok(tasks)
    }

    /// 启动所有任务，任一任务失败时取消共享令牌
    fn start_tasks(&self, tasks: Vec<Box<dyn Task>>) -> JoinSet<(String, TaskResult)> {
        let mut join_set = JoinSet::new();
        info!(task_count = tasks.len(), "Starting tasks");

        for task in tasks {
            let task_name = task.name().to_string();
            let cancel = self.cancel.clone();
            let task_future = task.run(cancel.clone());

            join_set.spawn(async move {
                let result = task_future.await;
                match &result {
                    Ok(()) => {
                        info!(task_name = %task_name, "✅ Task completed");
                    }
                    Err(e) => {
                        error!(task_name = %task_name, error = %e, "❌ Task failed");
                        cancel.cancel();
                    }
                }
                (task_name, result)
            });
        }

        join_set
    }

    /// 记录任务结果，只保留第一个错误
    fn record(
        cancel: &CancellationToken,
        first_error: &mut Option<ServiceError>,
        joined: std::result::Result<(String, TaskResult), JoinError>,
    ) {
        let err = match joined {
            Ok((_, Ok(()))) => return,
            Ok((_, Err(e))) => e,
            Err(e) => {
                error!(error = %e, "❌ Task panicked or was aborted");
                cancel.cancel();
                ServiceError::unexpected("task join", e)
            }
        };
        if first_error.is_none() {
            *first_error = Some(err);
        }
    }

    /// 等待所有任务关闭
    async fn wait_for_tasks_shutdown(
        config: &RuntimeConfig,
        cancel: &CancellationToken,
        join_set: &mut JoinSet<(String, TaskResult)>,
        first_error: &mut Option<ServiceError>,
    ) {
        let drained = tokio::time::timeout(config.shutdown_timeout, async {
            while let Some(joined) = join_set.join_next().await {
                Self::record(cancel, first_error, joined);
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All tasks completed"),
            Err(_) => {
                warn!(
                    remaining = join_set.len(),
                    timeout = ?config.shutdown_timeout,
                    "Tasks shutdown timeout, aborting"
                );
                join_set.shutdown().await;
                if first_error.is_none() {
                    *first_error = Some(ServiceError::TimeOut(format!(
                        "tasks did not stop within {:?}",
                        config.shutdown_timeout
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::pubsub::handler_fn;
    use crate::service::BaseService;
    use async_trait::async_trait;
    use std::time::Duration;

    fn runtime() -> ServiceRuntime {
        ServiceRuntime::new("test").with_config(
            RuntimeConfig::new()
                .with_os_signals(false)
                .with_shutdown_timeout(Duration::from_millis(200)),
        )
    }

    struct FailingInit;

    #[async_trait]
    impl CloudService for FailingInit {
        async fn init(&mut self, _cancel: &CancellationToken) -> std::result::Result<(), BoxError> {
            Err("database unreachable".into())
        }
    }

    #[tokio::test]
    async fn init_failure_is_fatal() {
        let runtime = runtime();
        let state = runtime.state();
        let err = runtime.run(FailingInit).await.unwrap_err();
        assert!(matches!(err, ServiceError::Init(_)));
        assert_eq!(*state.borrow(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn events_without_bus_are_rejected() {
        let service = BaseService::new()
            .register_event("event.created", handler_fn(|_, _| async { Ok(()) }));
        let err = runtime().run(service).await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected: message bus not initialized");
    }

    #[tokio::test]
    async fn service_without_capabilities_stops_immediately() {
        runtime().run(BaseService::new()).await.unwrap();
    }

    #[tokio::test]
    async fn first_task_error_cancels_the_rest() {
        let runtime = runtime()
            .add_spawn_with_shutdown("failing", |_| async {
                Err(ServiceError::Unexpected("boom".into()))
            })
            .add_spawn_with_shutdown("waiting", |cancel| async move {
                cancel.cancelled().await;
                Err(ServiceError::TimeOut("late".into()))
            });

        let err = runtime.run(BaseService::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected: boom");
    }

    #[tokio::test]
    async fn stuck_task_is_aborted_after_timeout() {
        let runtime = runtime()
            .with_shutdown_signal(async {})
            .add_spawn_with_shutdown("stuck", |_| async {
                std::future::pending::<()>().await;
                Ok(())
            });

        let err = tokio::time::timeout(Duration::from_secs(5), runtime.run(BaseService::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ServiceError::TimeOut(_)));
    }
}
