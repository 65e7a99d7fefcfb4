//! 错误代码和错误类别定义
//!
//! 错误代码按类别分组，每个类别占用1000个代码范围：
//! - 1000-1999: 连接相关错误
//! - 2000-2999: 消息相关错误
//! - 3000-3999: 服务生命周期相关错误
//! - 4000-4999: 请求相关错误
//! - 9000-9999: 通用错误

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionClosed = 1000,
    ConnectionBroken = 1001,
    ChannelBroken = 1002,

    // ============================================================
    // 消息相关错误 (2000-2999)
    // ============================================================
    UnknownTopic = 2000,
    HandlerFailed = 2001,

    // ============================================================
    // 服务生命周期相关错误 (3000-3999)
    // ============================================================
    InitFailed = 3000,
    BindFailed = 3001,
    InvalidConfig = 3002,

    // ============================================================
    // 请求相关错误 (4000-4999)
    // ============================================================
    AlreadyExists = 4000,
    BadRequest = 4001,
    NotAllowed = 4002,
    NotFound = 4003,
    SpaceFull = 4004,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    TimeOut = 9000,
    Unexpected = 9999,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::ConnectionBroken => "CONNECTION_BROKEN",
            ErrorCode::ChannelBroken => "CHANNEL_BROKEN",
            ErrorCode::UnknownTopic => "UNKNOWN_TOPIC",
            ErrorCode::HandlerFailed => "HANDLER_FAILED",
            ErrorCode::InitFailed => "INIT_FAILED",
            ErrorCode::BindFailed => "BIND_FAILED",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotAllowed => "NOT_ALLOWED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::SpaceFull => "SPACE_FULL",
            ErrorCode::TimeOut => "TIME_OUT",
            ErrorCode::Unexpected => "UNEXPECTED",
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 连接已关闭不算：调用方必须重新创建消息总线，而不是原样重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionBroken | ErrorCode::ChannelBroken | ErrorCode::TimeOut
        )
    }

    /// 对应的 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest | ErrorCode::UnknownTopic => 400,
            ErrorCode::NotAllowed => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists => 409,
            ErrorCode::SpaceFull => 507,
            ErrorCode::TimeOut => 504,
            ErrorCode::ConnectionClosed | ErrorCode::ConnectionBroken | ErrorCode::ChannelBroken => {
                503
            }
            _ => 500,
        }
    }
}
