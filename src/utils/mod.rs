//! 工具函数模块

use crate::error::{Result, ServiceError};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(20);
const MAX_DELAY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// 等待 TCP 服务可以接受连接
///
/// 以指数退避重试连接，超过 `deadline` 返回 [`ServiceError::TimeOut`]。
/// 适用于 REST、RPC 等任何基于 TCP 的服务。
///
/// ```rust,no_run
/// use compass_service_core::utils::wait_for_server_ready;
/// use std::time::Duration;
///
/// # async fn example() -> compass_service_core::Result<()> {
/// wait_for_server_ready("127.0.0.1:8080".parse().unwrap(), Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn wait_for_server_ready(address: SocketAddr, deadline: Duration) -> Result<()> {
    let start = Instant::now();
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Server is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(address = %address, attempt, error = %e, "Connection attempt failed, retrying...");
            }
            Err(_) => {
                debug!(address = %address, attempt, "Connection attempt timed out, retrying...");
            }
        }

        if start.elapsed() >= deadline {
            return Err(ServiceError::TimeOut(format!(
                "{} not ready after {} attempts in {:?}",
                address, attempt, deadline
            )));
        }
        sleep(delay).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        wait_for_server_ready(address, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_when_nothing_listens() {
        let address = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = wait_for_server_ready(address, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TimeOut(_)));
    }
}
