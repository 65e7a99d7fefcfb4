//! 日志初始化
//!
//! 安装全局 tracing subscriber，并把 `log` crate 的记录（lapin 使用）转发到 tracing。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// 初始化全局日志
///
/// `RUST_LOG` 存在时优先使用，否则使用 `default_level`（如 `"info"`、
/// `"compass_service_core=debug,lapin=warn"`）。整个进程只能调用一次。
pub fn init_tracing(format: LogFormat, default_level: &str) -> Result<()> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("Invalid log filter: {}", default_level))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Plain => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(fmt_layer).with(filter);
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;
    Ok(())
}
