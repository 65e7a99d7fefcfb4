//! 事件处理器
//!
//! 处理器对每条收到的消息调用一次。返回 `Err` 时消息不会被确认，
//! 订阅按 [`HandlerErrorPolicy`](crate::pubsub::HandlerErrorPolicy) 处理。

use crate::error::{BoxError, ServiceError};
use crate::pubsub::payload::{EventPayload, Payload};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 处理器结果
pub type HandlerResult = Result<(), BoxError>;

/// 事件处理器 trait
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理一条已解码的消息
    ///
    /// `cancel` 在服务关闭时被触发，长耗时的处理器应该观察它。
    async fn handle(&self, cancel: CancellationToken, payload: EventPayload) -> HandlerResult;
}

/// topic → 处理器 的注册表
pub type EventMap = BTreeMap<String, Arc<dyn EventHandler>>;

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(CancellationToken, EventPayload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, cancel: CancellationToken, payload: EventPayload) -> HandlerResult {
        (self.f)(cancel, payload).await
    }
}

/// 用闭包创建处理器
///
/// ```rust,no_run
/// use compass_service_core::pubsub::handler_fn;
///
/// let handler = handler_fn(|_cancel, payload| async move {
///     tracing::info!(topic = payload.topic(), "received");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(CancellationToken, EventPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn(P)>,
}

#[async_trait]
impl<P, F, Fut> EventHandler for TypedHandler<P, F>
where
    P: Payload,
    F: Fn(CancellationToken, P) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, cancel: CancellationToken, payload: EventPayload) -> HandlerResult {
        let topic = payload.topic();
        match P::from_event(payload) {
            Some(p) => (self.f)(cancel, p).await,
            None => Err(Box::new(ServiceError::Unexpected(format!(
                "handler for {} received {}",
                P::KIND.topic(),
                topic
            )))),
        }
    }
}

/// 只接收某一种载荷的处理器
///
/// 订阅通配 topic 时收到其他种类的消息会被当作错误。
pub fn typed_handler<P, F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    P: Payload,
    F: Fn(CancellationToken, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _payload: PhantomData::<fn(P)>,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::payload::{EventBooked, LocationCreated};
    use std::sync::Mutex;

    #[tokio::test]
    async fn typed_handler_receives_its_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = typed_handler(move |_cancel, booked: EventBooked| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(booked.user_id);
                Ok(())
            }
        });

        let payload = EventPayload::from(EventBooked {
            event_id: "e1".into(),
            user_id: "u1".into(),
        });
        handler.handle(CancellationToken::new(), payload).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn typed_handler_rejects_other_kinds() {
        let handler = typed_handler(|_cancel, _booked: EventBooked| async { Ok(()) });
        let payload = EventPayload::from(LocationCreated {
            id: "l1".into(),
            name: "Hall".into(),
        });
        let err = handler
            .handle(CancellationToken::new(), payload)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("location.created"));
    }
}
