//! 服务运行时集成测试
//!
//! 覆盖完整生命周期：启动 REST 与事件订阅、注入停机信号、端口冲突时的失败传播。

use axum::{routing::get, Router};
use compass_service_core::config::{RestConfig, RpcConfig};
use compass_service_core::pubsub::{handler_fn, AmqpBus, MemoryBroker, MessageBus};
use compass_service_core::runtime::{RuntimeConfig, RuntimeState, ServiceRuntime};
use compass_service_core::service::BaseService;
use compass_service_core::utils::wait_for_server_ready;
use compass_service_core::ServiceError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::service::Routes;

const WAIT: Duration = Duration::from_secs(5);

fn free_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn rest_config(address: SocketAddr) -> RestConfig {
    RestConfig {
        listen: address.to_string(),
        shutdown_timeout: Duration::from_secs(1),
        ..RestConfig::default()
    }
}

fn runtime_config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_os_signals(false)
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn ping_router() -> Router {
    Router::new().route("/ping", get(|| async { "pong" }))
}

#[tokio::test]
async fn injected_signal_stops_rest_and_subscriptions() {
    let broker = MemoryBroker::new();
    let bus: Arc<dyn MessageBus> = Arc::new(AmqpBus::new(broker.connect(), "events"));
    let address = free_address();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let service = BaseService::new()
        .register_rest(ping_router())
        .register_event("event.created", handler_fn(|_cancel, _payload| async { Ok(()) }))
        .register_event("event.booked", handler_fn(|_cancel, _payload| async { Ok(()) }))
        .register_bus(bus);

    let runtime = ServiceRuntime::new("events-test")
        .with_config(runtime_config())
        .with_rest_config(rest_config(address))
        .with_shutdown_signal(async move {
            let _ = stop_rx.await;
        });
    let mut state = runtime.state();
    let running = tokio::spawn(runtime.run(service));

    wait_for_server_ready(address, WAIT).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while broker.consumer_count() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*state.borrow_and_update(), RuntimeState::Serving);

    let body = reqwest::get(format!("http://{}/ping", address))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "pong");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(*state.borrow(), RuntimeState::Stopped);
    assert_eq!(broker.queue_count(), 0);
    let stats = broker.stats();
    assert_eq!(stats.queues_deleted, 2);
    assert_eq!(stats.sessions_opened, stats.sessions_closed);
    assert!(tokio::net::TcpStream::connect(address).await.is_err());
}

#[tokio::test]
async fn occupied_rpc_port_fails_the_whole_service() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let rpc_address = occupied.local_addr().unwrap();
    let rest_address = free_address();

    let service = BaseService::new()
        .register_rest(ping_router())
        .register_rpc(Routes::default());

    let runtime = ServiceRuntime::new("bind-test")
        .with_config(runtime_config())
        .with_rest_config(rest_config(rest_address))
        .with_rpc_config(RpcConfig {
            listen: rpc_address.to_string(),
            client_timeout: None,
        });

    let err = tokio::time::timeout(WAIT, runtime.run(service))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        ServiceError::Bind { address, .. } => assert_eq!(address, rpc_address.to_string()),
        other => panic!("expected bind error, got {:?}", other),
    }
    assert!(tokio::net::TcpStream::connect(rest_address).await.is_err());
    drop(occupied);
}

#[tokio::test]
async fn failing_subscription_stops_rest_server() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let bus: Arc<dyn MessageBus> = Arc::new(AmqpBus::new(conn, "events"));
    let address = free_address();

    let service = BaseService::new()
        .register_rest(ping_router())
        .register_event("#", handler_fn(|_cancel, _payload| async { Ok(()) }))
        .register_bus(bus);

    let runtime = ServiceRuntime::new("broker-test")
        .with_config(runtime_config())
        .with_rest_config(rest_config(address));
    let cancel = runtime.cancellation_token();
    let running = tokio::spawn(runtime.run(service));

    wait_for_server_ready(address, WAIT).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while broker.consumer_count() < 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    broker.disconnect();
    let err = tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ServiceError::ConnectionBroken(_)));
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn cancellation_token_acts_as_shutdown_signal() {
    let address = free_address();
    let runtime = ServiceRuntime::new("token-test")
        .with_config(runtime_config())
        .with_rest_config(rest_config(address));
    let cancel = runtime.cancellation_token();
    let running = tokio::spawn(runtime.run(BaseService::new().register_rest(ping_router())));

    wait_for_server_ready(address, WAIT).await.unwrap();
    cancel.cancel();
    tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
