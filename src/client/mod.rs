//! RPC 客户端
//!
//! 按 [`RpcConfig::client_timeout`] 设置单次请求超时，与服务端保持一致。

use crate::config::RpcConfig;
use crate::error::{Result, ServiceError};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub connect_timeout: Duration,
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8081".to_string(),
            connect_timeout: Duration::from_secs(5),
            timeout: None,
        }
    }
}

impl ClientConfig {
    /// 按服务端的 RPC 配置创建客户端配置
    pub fn from_rpc(address: impl Into<String>, rpc: &RpcConfig) -> Self {
        Self {
            address: address.into(),
            timeout: rpc.client_timeout,
            ..Self::default()
        }
    }
}

/// 客户端构建器
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    fn endpoint(&self) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(self.config.address.clone())
            .map_err(|e| ServiceError::Config(format!("invalid rpc address {}: {}", self.config.address, e)))?
            .connect_timeout(self.config.connect_timeout);
        if let Some(timeout) = self.config.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        Ok(endpoint)
    }

    /// 立即建立连接
    pub async fn build(self) -> Result<Channel> {
        self.endpoint()?
            .connect()
            .await
            .map_err(|e| ServiceError::connection(format!("rpc dial {}", self.config.address), e))
    }

    /// 延迟到第一次请求时再建立连接
    pub fn build_lazy(self) -> Result<Channel> {
        Ok(self.endpoint()?.connect_lazy())
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
