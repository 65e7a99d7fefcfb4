//! 消息总线抽象
//!
//! 生命周期编排和业务代码只依赖 [`MessageBus`]，不依赖具体的 broker。

use crate::error::Result;
use crate::pubsub::handler::EventHandler;
use crate::pubsub::payload::{EventPayload, Payload};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 消息总线 trait
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布一条消息，routing key 为载荷的 topic
    ///
    /// 连接已关闭时返回 [`ServiceError::ConnectionClosed`](crate::ServiceError::ConnectionClosed)，
    /// 不做任何网络操作。发布失败不会重试。
    async fn publish(&self, payload: &EventPayload) -> Result<()>;

    /// 订阅 topic（允许 `*` / `#` 通配）
    ///
    /// 阻塞直到 `cancel` 被触发（返回 `Ok(())`）或出现错误。每条消息在
    /// 处理器成功返回后才确认。
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>;

    /// 关闭底层连接，不保证幂等
    async fn close(&self) -> Result<()>;
}

/// 处理器返回错误时订阅的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerErrorPolicy {
    /// 不确认消息，订阅以 [`ServiceError::Handler`](crate::ServiceError::Handler) 结束
    #[default]
    FailFast,
    /// 记录错误，确认消息，继续消费
    Continue,
}

/// 便捷方法
#[async_trait]
pub trait MessageBusExt: MessageBus {
    /// 发布具体类型的载荷
    async fn publish_payload<P: Payload>(&self, payload: P) -> Result<()> {
        self.publish(&payload.into()).await
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}
