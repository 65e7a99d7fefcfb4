//! 进程级共享连接
//!
//! 同一个进程内所有总线实例共用一条 broker 连接。第一个调用者负责拨号，
//! 并发的调用者等待同一次拨号的结果。拨号失败不会被缓存，下一次调用会重新拨号；
//! 共享连接被关闭后同样会在下一次调用时重新拨号。

use super::transport::BrokerConnection;
use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

type Slot = Option<Arc<dyn BrokerConnection>>;

/// 共享连接的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// 连接工厂
pub struct ConnectionFactory {
    current: Mutex<Slot>,
    // 串行化拨号，保证同一时刻只有一个调用者在拨号
    dial_lock: tokio::sync::Mutex<()>,
    dialing: AtomicBool,
    dials: AtomicUsize,
}

static PROCESS_FACTORY: ConnectionFactory = ConnectionFactory::new();

struct DialGuard<'a>(&'a AtomicBool);

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConnectionFactory {
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(None),
            dial_lock: tokio::sync::Mutex::const_new(()),
            dialing: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
        }
    }

    /// 进程级实例
    pub fn process() -> &'static ConnectionFactory {
        &PROCESS_FACTORY
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.slot()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .map(Arc::clone)
    }

    /// 返回可用的共享连接；没有或已关闭时调用 `dial` 建立一条
    ///
    /// 连接可用期间传入的 `dial` 不会被调用。
    pub async fn get_or_dial<F, Fut>(&self, dial: F) -> Result<Arc<dyn BrokerConnection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn BrokerConnection>>>,
    {
        if let Some(conn) = self.open_connection() {
            return Ok(conn);
        }

        let _serial = self.dial_lock.lock().await;
        if let Some(conn) = self.open_connection() {
            return Ok(conn);
        }

        self.dialing.store(true, Ordering::Release);
        let _guard = DialGuard(&self.dialing);
        let attempt = self.dials.fetch_add(1, Ordering::AcqRel) + 1;
        if self.slot().is_some() {
            info!(attempt, "Shared broker connection was closed, redialing");
        } else {
            debug!(attempt, "Dialing shared broker connection");
        }

        let conn = dial().await?;
        *self.slot() = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// 当前状态
    pub fn state(&self) -> ConnectionState {
        if self.dialing.load(Ordering::Acquire) {
            return ConnectionState::Connecting;
        }
        match self.slot().as_ref() {
            Some(conn) if conn.is_closed() => ConnectionState::Closed,
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        }
    }

    /// 已经发起的拨号次数
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Acquire)
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::pubsub::amqp::memory::MemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_dial() {
        let factory = Arc::new(ConnectionFactory::new());
        let broker = MemoryBroker::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let factory = factory.clone();
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                factory
                    .get_or_dial(|| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(broker.connect() as Arc<dyn BrokerConnection>)
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut conns = Vec::new();
        for handle in handles {
            conns.push(handle.await.unwrap());
        }

        assert_eq!(factory.dial_count(), 1);
        assert_eq!(broker.stats().connections_opened, 1);
        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(factory.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_dial_is_retried() {
        let factory = ConnectionFactory::new();
        assert_eq!(factory.state(), ConnectionState::Disconnected);

        let err = factory
            .get_or_dial(|| async { Err(ServiceError::ConnectionBroken("refused".into())) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::ConnectionBroken(_)));
        assert_eq!(factory.state(), ConnectionState::Disconnected);

        let broker = MemoryBroker::new();
        factory
            .get_or_dial(|| async { Ok(broker.connect() as Arc<dyn BrokerConnection>) })
            .await
            .unwrap();
        assert_eq!(factory.dial_count(), 2);
        assert_eq!(factory.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let factory = ConnectionFactory::new();
        let broker = MemoryBroker::new();
        let conn = factory
            .get_or_dial(|| async { Ok(broker.connect() as Arc<dyn BrokerConnection>) })
            .await
            .unwrap();

        conn.close().await.unwrap();
        assert_eq!(factory.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn closed_connection_is_redialed() {
        let factory = ConnectionFactory::new();
        let broker = MemoryBroker::new();
        let first = factory
            .get_or_dial(|| async { Ok(broker.connect() as Arc<dyn BrokerConnection>) })
            .await
            .unwrap();
        first.close().await.unwrap();

        let second = factory
            .get_or_dial(|| async { Ok(broker.connect() as Arc<dyn BrokerConnection>) })
            .await
            .unwrap();
        assert_eq!(factory.dial_count(), 2);
        assert!(!second.is_closed());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.state(), ConnectionState::Connected);

        let third = factory
            .get_or_dial(|| async { Ok(broker.connect() as Arc<dyn BrokerConnection>) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(factory.dial_count(), 2);
        assert_eq!(broker.stats().connections_opened, 2);
    }
}
