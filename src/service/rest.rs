//! REST 服务
//!
//! 用 hyper-util 的连接构建器托管 axum 路由，以便设置请求头读取超时。
//! 请求体读取超时和响应超时由 tower-http 的中间件负责。

use crate::config::{resolve_listen, RestConfig};
use crate::error::{Result, ServiceError};
use crate::runtime::task::{SpawnTask, Task};
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// REST 服务
pub struct RestServer {
    config: RestConfig,
    router: Router,
}

impl RestServer {
    pub fn new(config: RestConfig, router: Router) -> Self {
        Self { config, router }
    }

    /// 加上超时、请求转储和追踪中间件后的路由
    #[allow(deprecated)]
    pub fn app(&self) -> Router {
        let mut app = self.router.clone();
        if self.config.dump_requests {
            app = app.layer(middleware::from_fn(dump_request));
        }
        app.layer(RequestBodyTimeoutLayer::new(self.config.read_timeout))
            .layer(TimeoutLayer::new(self.config.write_timeout))
            .layer(TraceLayer::new_for_http())
    }

    /// 绑定监听地址
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = resolve_listen(&self.config.listen);
        TcpListener::bind(&address)
            .await
            .map_err(|source| ServiceError::Bind { address, source })
    }

    /// 绑定并服务，直到 `stop` 被触发后优雅退出
    pub async fn serve(self, stop: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_on(listener, stop).await
    }

    /// 在已绑定的监听器上服务
    ///
    /// `stop` 触发后立即停止接受新连接，已建立的连接处理完当前请求后关闭，
    /// 最多等待 `shutdown_timeout`。
    pub async fn serve_on(self, listener: TcpListener, stop: CancellationToken) -> Result<()> {
        let address = listener.local_addr()?;
        let service = TowerToHyperService::new(self.app());

        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_header_timeout);

        let graceful = GracefulShutdown::new();
        info!(address = %address, "🚀 REST server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(address = %address, error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service.clone());
            let conn = graceful.watch(conn.into_owned());
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(peer = %peer, error = %e, "Connection closed with error");
                }
            });
        }

        drop(listener);
        info!(address = %address, "REST server draining connections");
        tokio::select! {
            _ = graceful.shutdown() => {
                info!(address = %address, "REST server stopped");
            }
            _ = tokio::time::sleep(self.config.shutdown_timeout) => {
                warn!(address = %address, "REST server shutdown timed out, dropping connections");
            }
        }
        Ok(())
    }

    /// 服务任务和停止任务
    ///
    /// 停止任务在运行时取消时让服务任务优雅退出，超过 `shutdown_timeout`
    /// 仍未退出时返回 [`ServiceError::TimeOut`]。
    pub fn into_tasks(self) -> Vec<Box<dyn Task>> {
        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let shutdown_timeout = self.config.shutdown_timeout;

        let serve = {
            let stop = stop.clone();
            let done = done.clone();
            SpawnTask::new("rest-serve", async move {
                let _done = done.drop_guard();
                self.serve(stop).await
            })
        };

        let stop_task = SpawnTask::with_shutdown("rest-stop", move |cancel| async move {
            cancel.cancelled().await;
            stop.cancel();
            tokio::time::timeout(shutdown_timeout, done.cancelled())
                .await
                .map_err(|_| {
                    ServiceError::TimeOut(format!(
                        "rest server did not stop within {:?}",
                        shutdown_timeout
                    ))
                })
        });

        vec![Box::new(serve), Box::new(stop_task)]
    }
}

/// 在 debug 级别记录完整请求（方法、URI、请求头、请求体）
async fn dump_request(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(method = %parts.method, uri = %parts.uri, error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    debug!(
        method = %parts.method,
        uri = %parts.uri,
        headers = ?parts.headers,
        body = %String::from_utf8_lossy(&bytes),
        "HTTP request"
    );
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use tower::ServiceExt;

    fn config(dump_requests: bool) -> RestConfig {
        RestConfig {
            listen: "127.0.0.1:0".into(),
            dump_requests,
            ..RestConfig::default()
        }
    }

    fn echo() -> Router {
        Router::new().route("/echo", post(|body: String| async move { body }))
    }

    #[tokio::test]
    async fn dump_middleware_forwards_body() {
        let app = RestServer::new(config(true), echo()).app();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn bind_failure_reports_address() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen = occupied.local_addr().unwrap().to_string();
        let server = RestServer::new(
            RestConfig {
                listen: listen.clone(),
                ..RestConfig::default()
            },
            echo(),
        );

        match server.bind().await {
            Err(ServiceError::Bind { address, .. }) => assert_eq!(address, listen),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn stop_ends_serving() {
        let server = RestServer::new(config(false), echo());
        let listener = server.bind().await.unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(server.serve_on(listener, stop.clone()));

        stop.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
