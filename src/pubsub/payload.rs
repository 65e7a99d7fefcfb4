//! 载荷注册表
//!
//! 每种载荷在编译期绑定唯一的 topic。发布端用 [`PayloadKind::topic`] 选择
//! routing key，订阅端用 [`PayloadKind::from_topic`] 从 routing key 反查
//! 解码目标，未注册的 topic 返回 [`ServiceError::UnknownTopic`]。

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// 默认交换机
pub const EVENTS_EXCHANGE: &str = "events";

pub const EVENT_CREATED_TOPIC: &str = "event.created";
pub const EVENT_BOOKED_TOPIC: &str = "event.booked";
pub const LOCATION_CREATED_TOPIC: &str = "location.created";

/// 已注册的载荷种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    EventCreated,
    EventBooked,
    LocationCreated,
}

impl PayloadKind {
    /// 全部已注册种类
    pub const ALL: [PayloadKind; 3] = [
        PayloadKind::EventCreated,
        PayloadKind::EventBooked,
        PayloadKind::LocationCreated,
    ];

    /// 载荷对应的 topic
    pub fn topic(self) -> &'static str {
        match self {
            PayloadKind::EventCreated => EVENT_CREATED_TOPIC,
            PayloadKind::EventBooked => EVENT_BOOKED_TOPIC,
            PayloadKind::LocationCreated => LOCATION_CREATED_TOPIC,
        }
    }

    /// 根据 topic 找到解码目标
    pub fn from_topic(topic: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.topic() == topic)
            .ok_or_else(|| ServiceError::UnknownTopic(topic.to_string()))
    }

    /// 把 JSON 消息体解码为该种类的载荷
    pub fn decode(self, body: &[u8]) -> Result<EventPayload> {
        let payload = match self {
            PayloadKind::EventCreated => EventPayload::EventCreated(from_json(self, body)?),
            PayloadKind::EventBooked => EventPayload::EventBooked(from_json(self, body)?),
            PayloadKind::LocationCreated => EventPayload::LocationCreated(from_json(self, body)?),
        };
        Ok(payload)
    }
}

fn from_json<T: DeserializeOwned>(kind: PayloadKind, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::unexpected(format!("unmarshal {}", kind.topic()), e))
}

/// 载荷种类对应的 topic
pub fn topic_of(kind: PayloadKind) -> &'static str {
    kind.topic()
}

/// 根据 topic 查找解码目标
pub fn decode_target_for(topic: &str) -> Result<PayloadKind> {
    PayloadKind::from_topic(topic)
}

/// 可以在消息总线上传输的载荷
pub trait Payload: Serialize + DeserializeOwned + Into<EventPayload> + Send + Sync + 'static {
    const KIND: PayloadKind;

    fn topic(&self) -> &'static str {
        Self::KIND.topic()
    }

    /// 从总线上的载荷取出具体类型，种类不符时返回 `None`
    fn from_event(payload: EventPayload) -> Option<Self>;
}

/// 事件创建通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCreated {
    pub id: String,
    pub name: String,
    pub location_id: String,
    #[serde(rename = "start_time")]
    pub start: DateTime<Utc>,
    #[serde(rename = "end_time")]
    pub end: DateTime<Utc>,
}

/// 地点创建通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationCreated {
    pub id: String,
    pub name: String,
}

/// 活动预订通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBooked {
    pub event_id: String,
    pub user_id: String,
}

/// 总线上流转的载荷（按种类打标签）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    EventCreated(EventCreated),
    EventBooked(EventBooked),
    LocationCreated(LocationCreated),
}

impl EventPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            EventPayload::EventCreated(_) => PayloadKind::EventCreated,
            EventPayload::EventBooked(_) => PayloadKind::EventBooked,
            EventPayload::LocationCreated(_) => PayloadKind::LocationCreated,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind().topic()
    }

    /// 序列化为 JSON 消息体（线上格式只包含载荷本身，不带种类标签）
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let body = match self {
            EventPayload::EventCreated(p) => serde_json::to_vec(p),
            EventPayload::EventBooked(p) => serde_json::to_vec(p),
            EventPayload::LocationCreated(p) => serde_json::to_vec(p),
        };
        body.map_err(|e| ServiceError::unexpected("marshal payload", e))
    }

    /// 按 routing key 选择解码目标并解码
    pub fn decode(topic: &str, body: &[u8]) -> Result<Self> {
        PayloadKind::from_topic(topic)?.decode(body)
    }
}

macro_rules! impl_payload {
    ($ty:ident) => {
        impl Payload for $ty {
            const KIND: PayloadKind = PayloadKind::$ty;

            fn from_event(payload: EventPayload) -> Option<Self> {
                match payload {
                    EventPayload::$ty(p) => Some(p),
                    _ => None,
                }
            }
        }

        impl From<$ty> for EventPayload {
            fn from(p: $ty) -> Self {
                EventPayload::$ty(p)
            }
        }
    };
}

impl_payload!(EventCreated);
impl_payload!(EventBooked);
impl_payload!(LocationCreated);
