//! AMQP 0-9-1 消息总线
//!
//! - [`AmqpBus`]：[`MessageBus`](crate::pubsub::MessageBus) 的 broker 实现
//! - [`ConnectionFactory`]：进程级共享连接
//! - [`transport`]：broker 传输抽象，[`lapin`] 和 [`memory`] 是它的两个实现

pub mod bus;
pub mod connection;
pub mod lapin;
pub mod memory;
pub mod transport;

pub use bus::{AmqpBus, BusOptions};
pub use connection::{ConnectionFactory, ConnectionState};
pub use memory::{BrokerStats, MemoryBroker, PublishedMessage};
pub use transport::{BrokerConnection, BrokerSession, Delivery, ExchangeKind, ExchangeSpec};
