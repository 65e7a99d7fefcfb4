//! 服务接口
//!
//! 一个服务可以暴露三种能力：REST 路由、RPC 路由和事件订阅。
//! [`ServiceRuntime`](crate::runtime::ServiceRuntime) 在 `init` 之后查询这些能力，
//! 为存在的能力启动对应的任务。

pub mod rest;
pub mod rpc;

pub use rest::RestServer;
pub use rpc::RpcServer;

use crate::error::BoxError;
use crate::pubsub::{EventHandler, EventMap, MessageBus};
use async_trait::async_trait;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;

/// 可以被运行时托管的服务
#[async_trait]
pub trait CloudService: Send + Sync {
    /// 初始化，在查询任何能力之前调用且只调用一次
    ///
    /// 返回错误时服务不会启动。`cancel` 是整个服务共用的取消令牌。
    async fn init(&mut self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }

    /// REST 路由，`None` 表示不提供 REST 服务
    fn rest(&self) -> Option<Router> {
        None
    }

    /// RPC 路由，`None` 表示不提供 RPC 服务
    fn rpc(&self) -> Option<Routes> {
        None
    }

    /// topic → 处理器，`None` 表示不订阅任何事件
    fn events(&self) -> Option<EventMap> {
        None
    }

    /// 订阅事件使用的消息总线
    fn bus(&self) -> Option<Arc<dyn MessageBus>> {
        None
    }
}

/// 通过注册方法组装能力的服务
///
/// ```rust,no_run
/// use axum::{routing::get, Router};
/// use compass_service_core::pubsub::handler_fn;
/// use compass_service_core::service::BaseService;
///
/// let service = BaseService::new()
///     .register_rest(Router::new().route("/ping", get(|| async { "pong" })))
///     .register_event("event.created", handler_fn(|_cancel, _payload| async { Ok(()) }));
/// ```
#[derive(Default, Clone)]
pub struct BaseService {
    rest: Option<Router>,
    rpc: Option<Routes>,
    events: EventMap,
    bus: Option<Arc<dyn MessageBus>>,
}

impl BaseService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_rest(mut self, router: Router) -> Self {
        self.rest = Some(router);
        self
    }

    pub fn register_rpc(mut self, routes: Routes) -> Self {
        self.rpc = Some(routes);
        self
    }

    /// 注册 topic 的处理器，同一 topic 重复注册时后者覆盖前者
    pub fn register_event(mut self, topic: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.events.insert(topic.into(), handler);
        self
    }

    pub fn register_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

#[async_trait]
impl CloudService for BaseService {
    fn rest(&self) -> Option<Router> {
        self.rest.clone()
    }

    fn rpc(&self) -> Option<Routes> {
        self.rpc.clone()
    }

    fn events(&self) -> Option<EventMap> {
        if self.events.is_empty() {
            None
        } else {
            Some(self.events.clone())
        }
    }

    fn bus(&self) -> Option<Arc<dyn MessageBus>> {
        self.bus.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::handler_fn;

    #[tokio::test]
    async fn empty_service_exposes_nothing() {
        let mut service = BaseService::new();
        service.init(&CancellationToken::new()).await.unwrap();
        assert!(service.rest().is_none());
        assert!(service.rpc().is_none());
        assert!(service.events().is_none());
        assert!(service.bus().is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let service = BaseService::new()
            .register_event("event.created", handler_fn(|_, _| async { Ok(()) }))
            .register_event("event.created", handler_fn(|_, _| async { Err("second".into()) }))
            .register_event("event.booked", handler_fn(|_, _| async { Ok(()) }));

        let events = service.events().unwrap();
        assert_eq!(
            events.keys().cloned().collect::<Vec<_>>(),
            vec!["event.booked".to_string(), "event.created".to_string()]
        );
    }
}
