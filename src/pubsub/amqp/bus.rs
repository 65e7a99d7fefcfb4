//! 基于 AMQP topic 交换机的消息总线
//!
//! 所有消息发布到同一个持久化 topic 交换机，routing key 即载荷的 topic。
//! 每次发布和每个订阅各开一个独立会话，会话之间互不影响；底层连接在进程内共享。

use super::connection::ConnectionFactory;
use super::lapin::LapinConnection;
use super::transport::{
    BrokerConnection, BrokerSession, Delivery, ExchangeSpec, OutgoingMessage, JSON_CONTENT_TYPE,
};
use crate::config::BusConfig;
use crate::error::{Result, ServiceError};
use crate::pubsub::bus::{HandlerErrorPolicy, MessageBus};
use crate::pubsub::handler::EventHandler;
use crate::pubsub::payload::EventPayload;
use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 总线选项
#[derive(Debug, Clone, Copy, Default)]
pub struct BusOptions {
    pub handler_errors: HandlerErrorPolicy,
}

/// AMQP 消息总线
pub struct AmqpBus {
    conn: Arc<dyn BrokerConnection>,
    exchange: ExchangeSpec,
    options: BusOptions,
}

impl AmqpBus {
    /// 通过进程级共享连接创建总线
    ///
    /// 进程内第一次调用会按 `config` 拨号，之后的调用复用同一条连接，
    /// 它们的 `config` 不再生效。共享连接被关闭后，下一次调用按当次的
    /// `config` 重新拨号。
    pub async fn connect(config: &BusConfig, exchange: impl Into<String>) -> Result<Self> {
        Self::connect_with(ConnectionFactory::process(), config, exchange).await
    }

    /// 通过指定的连接工厂创建总线
    pub async fn connect_with(
        factory: &ConnectionFactory,
        config: &BusConfig,
        exchange: impl Into<String>,
    ) -> Result<Self> {
        let uri = config.amqp_uri();
        Self::from_factory(
            factory,
            || async move {
                let conn = LapinConnection::dial(uri).await?;
                Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
            },
            exchange,
        )
        .await
    }

    /// 通过连接工厂创建总线，工厂没有可用连接时用 `dial` 建立
    pub async fn from_factory<F, Fut>(
        factory: &ConnectionFactory,
        dial: F,
        exchange: impl Into<String>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn BrokerConnection>>>,
    {
        let conn = factory.get_or_dial(dial).await?;
        Self::from_connection(conn, exchange).await
    }

    /// 在已有连接上创建总线，先开一次会话确认连接可用
    pub async fn from_connection(
        conn: Arc<dyn BrokerConnection>,
        exchange: impl Into<String>,
    ) -> Result<Self> {
        if conn.is_closed() {
            return Err(ServiceError::ConnectionClosed);
        }
        let session = conn.open_session().await?;
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close probe session");
        }
        Ok(Self::new(conn, exchange))
    }

    /// 直接包装连接，不做任何 I/O
    pub fn new(conn: Arc<dyn BrokerConnection>, exchange: impl Into<String>) -> Self {
        Self {
            conn,
            exchange: ExchangeSpec::durable_topic(exchange),
            options: BusOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BusOptions) -> Self {
        self.options = options;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange.name
    }

    pub fn options(&self) -> BusOptions {
        self.options
    }

    fn ensure_open(&self) -> Result<()> {
        if self.conn.is_closed() {
            return Err(ServiceError::ConnectionClosed);
        }
        Ok(())
    }

    async fn publish_on(
        &self,
        session: &mut dyn BrokerSession,
        topic: &str,
        body: &[u8],
    ) -> Result<()> {
        session.declare_exchange(&self.exchange).await?;
        session
            .publish(OutgoingMessage {
                exchange: &self.exchange.name,
                routing_key: topic,
                content_type: JSON_CONTENT_TYPE,
                body,
            })
            .await
    }

    async fn run_subscription(
        &self,
        session: &mut dyn BrokerSession,
        cancel: &CancellationToken,
        topic: &str,
        handler: &dyn EventHandler,
    ) -> Result<()> {
        session.declare_exchange(&self.exchange).await?;
        let queue = session.declare_queue().await?;
        let result = self.consume_queue(session, &queue, cancel, topic, handler).await;

        if let Err(e) = session.delete_queue(&queue).await {
            warn!(queue = %queue, topic, error = %e, "Failed to delete subscription queue");
        }
        result
    }

    async fn consume_queue(
        &self,
        session: &mut dyn BrokerSession,
        queue: &str,
        cancel: &CancellationToken,
        topic: &str,
        handler: &dyn EventHandler,
    ) -> Result<()> {
        session.bind_queue(queue, &self.exchange.name, topic).await?;
        let consumer_tag = format!("{}-{}", topic, Uuid::new_v4());
        let mut deliveries = session.consume(queue, &consumer_tag).await?;
        info!(topic, queue, exchange = %self.exchange.name, "✅ Subscribed");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(topic, "Subscription cancelled");
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ServiceError::ChannelBroken(format!(
                            "consumer for {} closed by broker",
                            topic
                        )));
                    }
                },
            };
            self.dispatch(&delivery, cancel, handler).await?;
        }
    }

    async fn dispatch(
        &self,
        delivery: &Delivery,
        cancel: &CancellationToken,
        handler: &dyn EventHandler,
    ) -> Result<()> {
        let payload = EventPayload::decode(&delivery.routing_key, &delivery.body)?;
        debug!(
            topic = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Dispatching message"
        );

        match handler.handle(cancel.clone(), payload).await {
            Ok(()) => delivery.ack().await,
            Err(e) => match self.options.handler_errors {
                HandlerErrorPolicy::FailFast => {
                    error!(topic = %delivery.routing_key, error = %e, "❌ Handler failed, stopping subscription");
                    Err(ServiceError::handler(delivery.routing_key.clone(), e))
                }
                HandlerErrorPolicy::Continue => {
                    warn!(topic = %delivery.routing_key, error = %e, "Handler failed, message dropped");
                    delivery.ack().await
                }
            },
        }
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, payload: &EventPayload) -> Result<()> {
        self.ensure_open()?;
        let topic = payload.topic();
        let body = payload.to_json()?;

        let mut session = self.conn.open_session().await?;
        let result = self.publish_on(session.as_mut(), topic, &body).await;
        if let Err(e) = session.close().await {
            warn!(topic, error = %e, "Failed to close publish session");
        }

        if result.is_ok() {
            debug!(topic, bytes = body.len(), "Message published");
        }
        result
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut session = self.conn.open_session().await?;
        let result = self
            .run_subscription(session.as_mut(), &cancel, topic, handler.as_ref())
            .await;
        if let Err(e) = session.close().await {
            warn!(topic, error = %e, "Failed to close subscription session");
        }
        result
    }

    async fn close(&self) -> Result<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::amqp::memory::MemoryBroker;
    use crate::pubsub::handler::handler_fn;
    use crate::pubsub::payload::LocationCreated;

    #[tokio::test]
    async fn from_connection_probes_with_one_session() {
        let broker = MemoryBroker::new();
        let bus = AmqpBus::from_connection(broker.connect(), "events")
            .await
            .unwrap();
        assert_eq!(bus.exchange(), "events");
        let stats = broker.stats();
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
    }

    #[tokio::test]
    async fn from_closed_connection_fails() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.close().await.unwrap();
        let err = AmqpBus::from_connection(conn, "events").await.err().unwrap();
        assert!(matches!(err, ServiceError::ConnectionClosed));
    }

    #[tokio::test]
    async fn publish_declares_durable_topic_exchange() {
        let broker = MemoryBroker::new();
        let bus = AmqpBus::new(broker.connect(), "events");
        bus.publish(&EventPayload::from(LocationCreated {
            id: "l1".into(),
            name: "Hall".into(),
        }))
        .await
        .unwrap();

        assert_eq!(
            broker.exchange("events"),
            Some(ExchangeSpec::durable_topic("events"))
        );
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "location.created");
        assert_eq!(published[0].content_type, JSON_CONTENT_TYPE);
        let stats = broker.stats();
        assert_eq!(stats.sessions_opened, stats.sessions_closed);
    }

    #[tokio::test]
    async fn subscription_ends_when_broker_drops_connection() {
        let broker = MemoryBroker::new();
        let bus = Arc::new(AmqpBus::new(broker.connect(), "events"));
        let cancel = CancellationToken::new();

        let sub = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bus.subscribe(cancel, "#", handler_fn(|_, _| async { Ok(()) }))
                    .await
            })
        };
        while broker.consumer_count() == 0 {
            tokio::task::yield_now().await;
        }

        broker.disconnect();
        let err = sub.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::ConnectionBroken(_)));
    }
}
