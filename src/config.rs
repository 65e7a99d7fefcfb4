//! 服务配置
//!
//! 配置可以从 TOML 文件加载，再用环境变量覆盖。环境变量名沿用
//! `HTTP_SERVER_*` / `GRPC_*` / `BUS_*` 约定。

use crate::error::{Result, ServiceError};
use crate::pubsub::payload::EVENTS_EXCHANGE;
use crate::runtime::config::RuntimeConfig;
use lapin::uri::AMQPUri;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// REST 服务配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RestConfig {
    /// REST 接口监听地址，`":8080"` 表示监听所有网卡
    pub listen: String,
    #[serde(with = "duration_str")]
    pub read_header_timeout: Duration,
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    #[serde(with = "duration_str")]
    pub write_timeout: Duration,
    /// 收到关闭信号后，等待在途请求完成的最长时间
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    /// 是否在 debug 日志里打印完整请求（含 body）
    pub dump_requests: bool,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            listen: ":8080".to_string(),
            read_header_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            dump_requests: false,
        }
    }
}

impl RestConfig {
    /// 默认配置 + 进程环境变量
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(env_lookup)
    }

    /// 用 `lookup` 返回的值覆盖对应字段
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("HTTP_SERVER_LISTEN") {
            self.listen = listen;
        }
        if let Some(v) = lookup("HTTP_SERVER_READ_HEADER_TIMEOUT") {
            self.read_header_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("HTTP_SERVER_READ_TIMEOUT") {
            self.read_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("HTTP_SERVER_WRITE_TIMEOUT") {
            self.write_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("HTTP_SERVER_DUMP_REQUESTS") {
            self.dump_requests = parse_bool("HTTP_SERVER_DUMP_REQUESTS", &v)?;
        }
        Ok(self)
    }
}

/// RPC 服务配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// RPC 接口监听地址
    pub listen: String,
    /// RPC 调用超时，服务端用作单请求超时，客户端用作调用超时
    #[serde(with = "duration_opt_str")]
    pub client_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: ":8081".to_string(),
            client_timeout: None,
        }
    }
}

impl RpcConfig {
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(env_lookup)
    }

    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("GRPC_SERVER_LISTEN") {
            self.listen = listen;
        }
        if let Some(v) = lookup("GRPC_CLIENT_TIMEOUT") {
            self.client_timeout = Some(parse_duration(&v)?);
        }
        Ok(self)
    }
}

/// 消息总线（AMQP broker）连接配置
#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

// 密码不进日志
impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(env_lookup)
    }

    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BUS_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("BUS_PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|e| ServiceError::Config(format!("BUS_PORT={}: {}", port, e)))?;
        }
        if let Some(username) = lookup("BUS_USERNAME") {
            self.username = username;
        }
        if let Some(password) = lookup("BUS_PASSWORD") {
            self.password = password;
        }
        Ok(self)
    }

    /// AMQP 连接 URI
    ///
    /// 按字段构造而不是拼接字符串，用户名和密码里的 `@`、`:`、`/` 不会破坏地址。
    pub fn amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri
    }
}

/// 服务整体配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub service_name: String,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

fn default_exchange() -> String {
    EVENTS_EXCHANGE.to_string()
}

impl ServiceConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("read {}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ServiceError::Config(e.to_string()))
    }

    /// 用进程环境变量覆盖文件中的配置
    pub fn apply_env(self) -> Result<Self> {
        self.apply_lookup(env_lookup)
    }

    pub fn apply_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.rest = self.rest.apply_env(&lookup)?;
        self.rpc = self.rpc.apply_env(&lookup)?;
        self.bus = self.bus.apply_env(&lookup)?;
        Ok(self)
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// 把 `":8080"` 这种只有端口的地址补全为 `"0.0.0.0:8080"`
pub fn resolve_listen(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ServiceError::Config(format!("{}={}: not a boolean", key, other))),
    }
}

/// 解析 `"10s"`、`"500ms"`、`"2m"`、`"1h"` 或纯数字（秒）
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number
        .parse()
        .map_err(|_| ServiceError::Config(format!("invalid duration: {:?}", value)))?;
    let duration = match unit {
        "" | "s" => Duration::from_secs(amount),
        "ms" => Duration::from_millis(amount),
        "m" => Duration::from_secs(checked_secs(amount, 60, value)?),
        "h" => Duration::from_secs(checked_secs(amount, 3600, value)?),
        _ => {
            return Err(ServiceError::Config(format!(
                "invalid duration unit {:?} in {:?}",
                unit, value
            )));
        }
    };
    Ok(duration)
}

fn checked_secs(amount: u64, unit_secs: u64, value: &str) -> Result<u64> {
    amount
        .checked_mul(unit_secs)
        .ok_or_else(|| ServiceError::Config(format!("duration out of range: {:?}", value)))
}

fn format_duration(duration: &Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> std::result::Result<Duration, E> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text).map_err(E::custom),
        }
    }
}

pub(crate) mod duration_str {
    use super::{RawDuration, format_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(d)?.into_duration()
    }
}

pub(crate) mod duration_opt_str {
    use super::{RawDuration, format_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&format_duration(d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(d)?
            .map(RawDuration::into_duration)
            .transpose()
    }
}
