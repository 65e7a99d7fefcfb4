//! Compass Service Core
//!
//! 微服务脚手架：服务生命周期编排、REST/RPC 服务托管，以及基于 AMQP topic
//! 交换机的消息总线。

pub mod client;
pub mod config;
pub mod error;
pub mod pubsub;
pub mod runtime;
pub mod service;
pub mod telemetry;
pub mod utils;

// Re-exports
pub use config::{BusConfig, RestConfig, RpcConfig, ServiceConfig};
pub use error::{BoxError, ErrorCode, Result, ServiceError};
pub use pubsub::{
    AmqpBus, EventHandler, EventMap, EventPayload, HandlerErrorPolicy, MessageBus, MessageBusExt,
    Payload, PayloadKind,
};
pub use runtime::{RuntimeConfig, RuntimeState, ServiceRuntime};
pub use service::{BaseService, CloudService};
pub use telemetry::{init_tracing, LogFormat};
