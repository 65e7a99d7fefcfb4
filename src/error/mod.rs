//! 服务框架错误处理模块
//!
//! 所有对外暴露的函数只返回 [`ServiceError`] 中的变体（或其包装）。
//! 错误信息遵循 "分类: 上下文: 原因" 的层级结构，例如：
//!
//! ```text
//! unexpected: queue declare: channel closed by server
//! ```
//!
//! 这样从日志里可以直接看出问题的分类、出错位置和根因。

pub mod code;
pub mod conversions;

pub use code::ErrorCode;

use std::fmt::Display;
use thiserror::Error;

/// 装箱的动态错误类型（事件处理器、初始化等由业务方实现的回调使用）
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 服务框架统一错误类型
#[derive(Error, Debug)]
pub enum ServiceError {
    /// 正在使用的连接已经关闭，调用方需要重新创建消息总线
    #[error("connection closed")]
    ConnectionClosed,

    /// 建立到 broker 的连接失败，或连接级别的操作失败
    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    /// 会话（AMQP channel）级别的操作失败：声明拓扑、发布、消费、确认
    #[error("channel broken: {0}")]
    ChannelBroken(String),

    /// 收到或被要求解码一个没有注册载荷类型的 topic
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// 事件处理器返回错误，订阅因此终止
    #[error("handler failed on topic {topic}: {source}")]
    Handler {
        topic: String,
        #[source]
        source: BoxError,
    },

    /// 服务初始化失败
    #[error("init: {0}")]
    Init(#[source] BoxError),

    /// 监听地址绑定失败
    #[error("bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// 配置无法解析
    #[error("config: {0}")]
    Config(String),

    /// 请求创建的资源已存在
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// 请求无法被理解或处理
    #[error("bad request: {0}")]
    BadRequest(String),

    /// 请求的操作不被允许
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// 请求的资源不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// 服务存储空间已满
    #[error("no space: {0}")]
    SpaceFull(String),

    /// 操作超出时间限制
    #[error("time out: {0}")]
    TimeOut(String),

    /// 看起来"不可能发生"的错误，任何函数都可能返回
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl ServiceError {
    /// 创建 `Unexpected` 错误，消息格式为 `<context>: <err>`
    ///
    /// 如果 `err` 本身已经是 `unexpected: ...` 形式，不会重复包装分类前缀。
    pub fn unexpected(context: impl Display, err: impl Display) -> Self {
        let cause = err.to_string();
        let cause = cause.strip_prefix("unexpected: ").unwrap_or(&cause);
        ServiceError::Unexpected(format!("{}: {}", context, cause))
    }

    /// 创建会话级别错误
    pub fn channel(context: impl Display, err: impl Display) -> Self {
        ServiceError::ChannelBroken(format!("{}: {}", context, err))
    }

    /// 创建连接级别错误
    pub fn connection(context: impl Display, err: impl Display) -> Self {
        ServiceError::ConnectionBroken(format!("{}: {}", context, err))
    }

    /// 包装事件处理器错误
    pub fn handler(topic: impl Into<String>, source: BoxError) -> Self {
        ServiceError::Handler {
            topic: topic.into(),
            source,
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::ConnectionClosed => ErrorCode::ConnectionClosed,
            ServiceError::ConnectionBroken(_) => ErrorCode::ConnectionBroken,
            ServiceError::ChannelBroken(_) => ErrorCode::ChannelBroken,
            ServiceError::UnknownTopic(_) => ErrorCode::UnknownTopic,
            ServiceError::Handler { .. } => ErrorCode::HandlerFailed,
            ServiceError::Init(_) => ErrorCode::InitFailed,
            ServiceError::Bind { .. } => ErrorCode::BindFailed,
            ServiceError::Config(_) => ErrorCode::InvalidConfig,
            ServiceError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            ServiceError::BadRequest(_) => ErrorCode::BadRequest,
            ServiceError::NotAllowed(_) => ErrorCode::NotAllowed,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::SpaceFull(_) => ErrorCode::SpaceFull,
            ServiceError::TimeOut(_) => ErrorCode::TimeOut,
            ServiceError::Unexpected(_) => ErrorCode::Unexpected,
        }
    }

    /// 判断调用方是否值得重试（重试策略本身由调用方决定）
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_keeps_hierarchical_message() {
        let err = ServiceError::unexpected("marshal payload", "key must be a string");
        assert_eq!(err.to_string(), "unexpected: marshal payload: key must be a string");
    }

    #[test]
    fn unexpected_does_not_double_wrap() {
        let inner = ServiceError::unexpected("queue declare", "boom");
        let outer = ServiceError::unexpected("subscribe", inner);
        assert_eq!(outer.to_string(), "unexpected: subscribe: queue declare: boom");
    }

    #[test]
    fn handler_error_exposes_source() {
        let err = ServiceError::handler("event.created", "db down".into());
        assert_eq!(err.code(), ErrorCode::HandlerFailed);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("db down"));
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ServiceError::ConnectionBroken("dial".into()).is_retryable());
        assert!(ServiceError::ChannelBroken("publish".into()).is_retryable());
        assert!(!ServiceError::ConnectionClosed.is_retryable());
        assert!(!ServiceError::UnknownTopic("x".into()).is_retryable());
    }
}
