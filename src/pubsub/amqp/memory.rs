//! 进程内 broker
//!
//! 按 AMQP 0-9-1 的语义实现 topic 交换机、服务端命名队列、手动确认和
//! nack 重新入队，供测试和本地开发使用。所有操作都会计入
//! [`BrokerStats`]，测试可以据此断言总线的拓扑操作和确认行为。

use super::transport::{
    topic_matches, Acknowledger, BrokerConnection, BrokerSession, Delivery, DeliveryStream,
    ExchangeSpec, OutgoingMessage,
};
use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// 操作计数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub exchanges_declared: usize,
    pub queues_declared: usize,
    pub queues_deleted: usize,
    pub published: usize,
    pub acked: usize,
    pub nacked: usize,
}

/// broker 收到的一条发布
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

type ConsumerTx = mpsc::UnboundedSender<Result<Delivery>>;

#[derive(Default)]
struct QueueState {
    bindings: Vec<(String, String)>,
    consumer: Option<ConsumerTx>,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, QueuedMessage>,
    next_tag: u64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    queue_seq: u64,
    published: Vec<PublishedMessage>,
    connections: Vec<Arc<AtomicBool>>,
    stats: BrokerStats,
}

type Shared = Arc<Mutex<BrokerState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 把消息交给队列的消费者；没有消费者时留在队列里
fn dispatch(shared: &Shared, queue_name: &str, queue: &mut QueueState, msg: QueuedMessage) {
    let Some(tx) = queue.consumer.clone() else {
        queue.ready.push_back(msg);
        return;
    };

    queue.next_tag += 1;
    let tag = queue.next_tag;
    let acker = MemoryAcker {
        shared: shared.clone(),
        queue: queue_name.to_string(),
        tag,
    };
    let delivery = Delivery::new(
        msg.routing_key.clone(),
        msg.body.clone(),
        tag,
        msg.redelivered,
        Box::new(acker),
    );
    if tx.send(Ok(delivery)).is_ok() {
        queue.unacked.insert(tag, msg);
    } else {
        queue.consumer = None;
        queue.ready.push_back(msg);
    }
}

/// 进程内 broker，克隆后共享同一份状态
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Shared,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立一条新连接
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let closed = Arc::new(AtomicBool::new(false));
        let mut state = lock(&self.shared);
        state.stats.connections_opened += 1;
        state.connections.push(closed.clone());
        Arc::new(MemoryConnection {
            broker: self.clone(),
            closed,
        })
    }

    pub fn stats(&self) -> BrokerStats {
        lock(&self.shared).stats.clone()
    }

    /// 按到达顺序返回所有发布
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared).published.clone()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        lock(&self.shared).exchanges.get(name).cloned()
    }

    /// 当前存在的队列数
    pub fn queue_count(&self) -> usize {
        lock(&self.shared).queues.len()
    }

    /// 当前有消费者的队列数
    pub fn consumer_count(&self) -> usize {
        lock(&self.shared)
            .queues
            .values()
            .filter(|q| q.consumer.is_some())
            .count()
    }

    /// 模拟 broker 断开所有连接：消费流收到错误后结束，队列被删除
    pub fn disconnect(&self) {
        let mut state = lock(&self.shared);
        for closed in &state.connections {
            closed.store(true, Ordering::Release);
        }
        for (name, queue) in state.queues.drain() {
            if let Some(tx) = queue.consumer {
                let _ = tx.send(Err(ServiceError::ConnectionBroken(format!(
                    "connection reset while consuming {}",
                    name
                ))));
            }
        }
        debug!("Memory broker dropped all connections");
    }
}

/// 进程内连接
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn open_session(&self) -> Result<Box<dyn BrokerSession>> {
        if self.is_closed() {
            return Err(ServiceError::ConnectionClosed);
        }
        lock(&self.broker.shared).stats.sessions_opened += 1;
        Ok(Box::new(MemorySession {
            shared: self.broker.shared.clone(),
            connection_closed: self.closed.clone(),
            consuming: Vec::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::ConnectionClosed);
        }
        Ok(())
    }
}

/// 进程内会话
pub struct MemorySession {
    shared: Shared,
    connection_closed: Arc<AtomicBool>,
    consuming: Vec<String>,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        if self.connection_closed.load(Ordering::Acquire) {
            return Err(ServiceError::ConnectionClosed);
        }
        Ok(lock(&self.shared))
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        let mut state = self.state()?;
        let conflict = state
            .exchanges
            .get(&spec.name)
            .filter(|existing| *existing != spec)
            .map(|existing| existing.kind);
        if let Some(current) = conflict {
            return Err(ServiceError::channel(
                "exchange declare",
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    spec.name,
                    spec.kind.as_str(),
                    current.as_str()
                ),
            ));
        }
        state
            .exchanges
            .entry(spec.name.clone())
            .or_insert_with(|| spec.clone());
        state.stats.exchanges_declared += 1;
        Ok(())
    }

    async fn declare_queue(&mut self) -> Result<String> {
        let mut state = self.state()?;
        state.queue_seq += 1;
        let name = format!("amq.gen-{:06}", state.queue_seq);
        state.queues.insert(name.clone(), QueueState::default());
        state.stats.queues_declared += 1;
        Ok(name)
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(ServiceError::channel(
                "queue bind",
                format!("NOT_FOUND - no exchange '{}'", exchange),
            ));
        }
        let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
            ServiceError::channel("queue bind", format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        queue_state
            .bindings
            .push((exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let shared = self.shared.clone();
        let mut state = self.state()?;
        let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
            ServiceError::channel("queue consume", format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        if queue_state.consumer.is_some() {
            return Err(ServiceError::channel(
                "queue consume",
                format!("ACCESS_REFUSED - queue '{}' already has a consumer", queue),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.consumer = Some(tx);
        let backlog: Vec<_> = queue_state.ready.drain(..).collect();
        for msg in backlog {
            dispatch(&shared, queue, queue_state, msg);
        }
        drop(state);

        debug!(queue, consumer_tag, "Memory consumer registered");
        self.consuming.push(queue.to_string());
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(&mut self, message: OutgoingMessage<'_>) -> Result<()> {
        let shared = self.shared.clone();
        let mut state = self.state()?;
        if !state.exchanges.contains_key(message.exchange) {
            return Err(ServiceError::channel(
                "publish message",
                format!("NOT_FOUND - no exchange '{}'", message.exchange),
            ));
        }

        state.published.push(PublishedMessage {
            exchange: message.exchange.to_string(),
            routing_key: message.routing_key.to_string(),
            content_type: message.content_type.to_string(),
            body: message.body.to_vec(),
        });
        state.stats.published += 1;

        for (name, queue) in state.queues.iter_mut() {
            let routed = queue.bindings.iter().any(|(exchange, pattern)| {
                exchange == message.exchange && topic_matches(pattern, message.routing_key)
            });
            if routed {
                let msg = QueuedMessage {
                    routing_key: message.routing_key.to_string(),
                    body: message.body.to_vec(),
                    redelivered: false,
                };
                dispatch(&shared, name, queue, msg);
            }
        }
        Ok(())
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.queues.remove(queue).is_some() {
                state.stats.queues_deleted += 1;
            }
        }
        self.consuming.retain(|q| q != queue);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.shared);
        for name in &self.consuming {
            // 自动删除的队列在最后一个消费者离开时删除，未确认的消息一并丢弃
            if let Some(queue) = state.queues.remove(name) {
                let dropped = queue.unacked.len() + queue.ready.len();
                debug!(queue = %name, dropped, "Memory consumer cancelled");
            }
        }
        state.stats.sessions_closed += 1;
        Ok(())
    }
}

struct MemoryAcker {
    shared: Shared,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState, op: &str) -> Result<QueuedMessage> {
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|queue| queue.unacked.remove(&self.tag))
            .ok_or_else(|| {
                ServiceError::channel(
                    op,
                    format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag),
                )
            })
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = lock(&self.shared);
        self.take(&mut state, "ack")?;
        state.stats.acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = lock(&self.shared);
        let mut msg = self.take(&mut state, "nack")?;
        state.stats.nacked += 1;
        if requeue {
            msg.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                dispatch(&self.shared, &self.queue, queue, msg);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::amqp::transport::ExchangeKind;

    async fn bound_queue(session: &mut Box<dyn BrokerSession>, pattern: &str) -> String {
        session
            .declare_exchange(&ExchangeSpec::durable_topic("events"))
            .await
            .unwrap();
        let queue = session.declare_queue().await.unwrap();
        session.bind_queue(&queue, "events", pattern).await.unwrap();
        queue
    }

    fn message<'a>(routing_key: &'a str, body: &'a [u8]) -> OutgoingMessage<'a> {
        OutgoingMessage {
            exchange: "events",
            routing_key,
            content_type: "application/json",
            body,
        }
    }

    #[tokio::test]
    async fn routes_by_topic_pattern() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut session = conn.open_session().await.unwrap();
        let queue = bound_queue(&mut session, "event.*").await;
        let mut deliveries = session.consume(&queue, "test").await.unwrap();

        session.publish(message("location.created", b"{}")).await.unwrap();
        session.publish(message("event.booked", b"{\"a\":1}")).await.unwrap();

        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key, "event.booked");
        assert_eq!(delivery.body, b"{\"a\":1}");
        delivery.ack().await.unwrap();
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.stats().published, 2);
    }

    #[tokio::test]
    async fn messages_wait_for_a_consumer() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut session = conn.open_session().await.unwrap();
        let queue = bound_queue(&mut session, "#").await;

        session.publish(message("event.created", b"1")).await.unwrap();
        let mut deliveries = session.consume(&queue, "late").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"1");
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut session = conn.open_session().await.unwrap();
        let queue = bound_queue(&mut session, "event.created").await;
        let mut deliveries = session.consume(&queue, "test").await.unwrap();

        session.publish(message("event.created", b"x")).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();
        assert!(second.ack().await.is_err());
    }

    #[tokio::test]
    async fn conflicting_exchange_declaration_fails() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut session = conn.open_session().await.unwrap();
        session
            .declare_exchange(&ExchangeSpec::durable_topic("events"))
            .await
            .unwrap();

        let fanout = ExchangeSpec {
            name: "events".into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        };
        let err = session.declare_exchange(&fanout).await.unwrap_err();
        assert!(matches!(err, ServiceError::ChannelBroken(_)));
    }

    #[tokio::test]
    async fn closed_connection_refuses_sessions() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.open_session().await.err(),
            Some(ServiceError::ConnectionClosed)
        ));
        assert!(matches!(conn.close().await, Err(ServiceError::ConnectionClosed)));
        assert_eq!(broker.stats().sessions_opened, 0);
    }

    #[tokio::test]
    async fn disconnect_breaks_consumers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut session = conn.open_session().await.unwrap();
        let queue = bound_queue(&mut session, "#").await;
        let mut deliveries = session.consume(&queue, "test").await.unwrap();

        broker.disconnect();
        assert!(matches!(
            deliveries.next().await,
            Some(Err(ServiceError::ConnectionBroken(_)))
        ));
        assert!(deliveries.next().await.is_none());
        assert!(conn.is_closed());
    }
}
