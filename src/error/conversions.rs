//! 错误类型转换实现
//!
//! 提供各种错误类型之间的转换

use super::{ErrorCode, ServiceError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use tonic::Status;

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        ServiceError::unexpected("io", err)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::unexpected("json", err)
    }
}

impl From<lapin::Error> for ServiceError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::InvalidConnectionState(
                lapin::ConnectionState::Closed | lapin::ConnectionState::Closing,
            ) => ServiceError::ConnectionClosed,
            lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
            | lapin::Error::MissingHeartbeatError => ServiceError::connection("amqp", err),
            _ => ServiceError::channel("amqp", err),
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err.code() {
            ErrorCode::AlreadyExists => Status::already_exists(message),
            ErrorCode::BadRequest | ErrorCode::UnknownTopic => Status::invalid_argument(message),
            ErrorCode::NotAllowed => Status::permission_denied(message),
            ErrorCode::NotFound => Status::not_found(message),
            ErrorCode::SpaceFull => Status::resource_exhausted(message),
            ErrorCode::TimeOut => Status::deadline_exceeded(message),
            ErrorCode::ConnectionClosed
            | ErrorCode::ConnectionBroken
            | ErrorCode::ChannelBroken => Status::unavailable(message),
            _ => Status::internal(message),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
