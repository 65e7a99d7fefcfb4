//! 基于 lapin 的 AMQP 0-9-1 传输实现

use super::transport::{
    Acknowledger, BrokerConnection, BrokerSession, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, OutgoingMessage,
};
use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ConnectionState};
use tracing::{debug, info};

const REPLY_SUCCESS: u16 = 200;

/// 把 lapin 错误归类，并带上出错的步骤
fn classify(context: &str, err: lapin::Error) -> ServiceError {
    match ServiceError::from(err) {
        ServiceError::ConnectionClosed => ServiceError::ConnectionClosed,
        ServiceError::ConnectionBroken(msg) => ServiceError::connection(context, msg),
        ServiceError::ChannelBroken(msg) => ServiceError::channel(context, msg),
        other => ServiceError::unexpected(context, other),
    }
}

/// lapin 连接
pub struct LapinConnection {
    inner: Connection,
}

impl LapinConnection {
    /// 拨号到 broker
    pub async fn dial(uri: AMQPUri) -> Result<Self> {
        let inner = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| ServiceError::connection("amqp dial", e))?;
        info!("AMQP connection established");
        Ok(Self { inner })
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_closed(&self) -> bool {
        matches!(
            self.inner.status().state(),
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error
        )
    }

    async fn open_session(&self) -> Result<Box<dyn BrokerSession>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| classify("pubsub channel", e))?;
        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Box::new(LapinSession { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| classify("close connection", e))?;
        info!("AMQP connection closed");
        Ok(())
    }
}

/// lapin channel
pub struct LapinSession {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

#[async_trait]
impl BrokerSession for LapinSession {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, exchange_kind(spec.kind), options, FieldTable::default())
            .await
            .map_err(|e| classify("exchange declare", e))
    }

    async fn declare_queue(&mut self) -> Result<String> {
        let options = QueueDeclareOptions {
            durable: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare("", options, FieldTable::default())
            .await
            .map_err(|e| classify("queue declare", e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify("queue bind", e))
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify("queue consume", e))?;

        let stream = consumer.map(|next| {
            next.map(|delivery| {
                Delivery::new(
                    delivery.routing_key.as_str(),
                    delivery.data,
                    delivery.delivery_tag,
                    delivery.redelivered,
                    Box::new(LapinAcker {
                        acker: delivery.acker,
                    }),
                )
            })
            .map_err(|e| classify("receive message", e))
        });
        Ok(stream.boxed())
    }

    async fn publish(&mut self, message: OutgoingMessage<'_>) -> Result<()> {
        let properties = BasicProperties::default().with_content_type(message.content_type.into());
        self.channel
            .basic_publish(
                message.exchange,
                message.routing_key,
                BasicPublishOptions::default(),
                message.body,
                properties,
            )
            .await
            .map_err(|e| classify("publish message", e))?
            .await
            .map_err(|e| classify("publish confirm", e))?;
        Ok(())
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("queue delete", e))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| classify("close channel", e))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("ack", e))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.acker
            .nack(options)
            .await
            .map(|_| ())
            .map_err(|e| classify("nack", e))
    }
}
