//! RPC 服务

use crate::config::{resolve_listen, RpcConfig};
use crate::error::{Result, ServiceError};
use crate::runtime::task::{SpawnTask, Task};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::info;

/// RPC 服务
pub struct RpcServer {
    config: RpcConfig,
    routes: Routes,
}

impl RpcServer {
    pub fn new(config: RpcConfig, routes: Routes) -> Self {
        Self { config, routes }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = resolve_listen(&self.config.listen);
        TcpListener::bind(&address)
            .await
            .map_err(|source| ServiceError::Bind { address, source })
    }

    pub async fn serve(self, stop: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_on(listener, stop).await
    }

    /// 在已绑定的监听器上服务，`stop` 触发后等待进行中的请求完成再返回
    pub async fn serve_on(self, listener: TcpListener, stop: CancellationToken) -> Result<()> {
        let address = listener.local_addr()?;
        let mut builder = Server::builder();
        if let Some(timeout) = self.config.client_timeout {
            builder = builder.timeout(timeout);
        }

        info!(address = %address, "🚀 RPC server listening");
        builder
            .add_routes(self.routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), stop.cancelled_owned())
            .await
            .map_err(|e| ServiceError::unexpected("rpc serve", e))?;
        info!(address = %address, "RPC server stopped");
        Ok(())
    }

    /// 服务任务和停止任务
    pub fn into_tasks(self) -> Vec<Box<dyn Task>> {
        let stop = CancellationToken::new();
        let done = CancellationToken::new();

        let serve = {
            let stop = stop.clone();
            let done = done.clone();
            SpawnTask::new("rpc-serve", async move {
                let _done = done.drop_guard();
                self.serve(stop).await
            })
        };

        let stop_task = SpawnTask::with_shutdown("rpc-stop", move |cancel| async move {
            cancel.cancelled().await;
            stop.cancel();
            done.cancelled().await;
            Ok(())
        });

        vec![Box::new(serve), Box::new(stop_task)]
    }
}
