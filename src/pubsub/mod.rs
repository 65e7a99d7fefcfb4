//! 发布/订阅
//!
//! 载荷注册表、消息总线抽象，以及基于 AMQP 的总线实现。

pub mod amqp;
pub mod bus;
pub mod handler;
pub mod payload;

pub use amqp::{AmqpBus, BusOptions, ConnectionFactory, ConnectionState, MemoryBroker};
pub use bus::{HandlerErrorPolicy, MessageBus, MessageBusExt};
pub use handler::{handler_fn, typed_handler, EventHandler, EventMap, HandlerResult};
pub use payload::{
    decode_target_for, topic_of, EventBooked, EventCreated, EventPayload, LocationCreated,
    Payload, PayloadKind, EVENTS_EXCHANGE, EVENT_BOOKED_TOPIC, EVENT_CREATED_TOPIC,
    LOCATION_CREATED_TOPIC,
};
