//! broker 传输抽象
//!
//! [`BrokerConnection`] 是进程内共享的物理连接；[`BrokerSession`] 是从连接上
//! 开出的会话（AMQP channel），每次发布、每个订阅各用一个，用完即关。
//! 会话以 `Box<dyn BrokerSession>` 的形式交给唯一的使用者，不可克隆，
//! 因此不会被两个并发操作共用。

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// 消息体的 content-type
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// 交换机类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// 交换机声明参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// 持久化的 topic 交换机
    pub fn durable_topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// 发布的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub content_type: &'a str,
    pub body: &'a [u8],
}

/// 消息确认器
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// 投递到订阅队列的一条消息
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// 确认消息已处理
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// 拒绝消息
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// 消费流
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// 共享的 broker 连接
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// 连接是否已关闭（不做网络往返）
    fn is_closed(&self) -> bool;

    /// 开一个新会话
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>>;

    /// 关闭连接
    async fn close(&self) -> Result<()>;
}

/// 单次操作独占的会话
#[async_trait]
pub trait BrokerSession: Send {
    /// 幂等声明交换机；参数冲突时报错
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()>;

    /// 声明由服务端命名、持久、无消费者时自动删除的队列，返回队列名
    async fn declare_queue(&mut self) -> Result<String>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// 以手动确认模式消费队列
    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn publish(&mut self, message: OutgoingMessage<'_>) -> Result<()>;

    async fn delete_queue(&mut self, queue: &str) -> Result<()>;

    /// 关闭会话，未确认的消息由 broker 重新投递
    async fn close(self: Box<Self>) -> Result<()>;
}

/// AMQP topic 匹配：`*` 匹配一个单词，`#` 匹配零个或多个单词
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => match_words(rest, key_rest),
            _ => false,
        },
    }
}
