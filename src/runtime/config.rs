//! 运行时配置模块

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 取消信号发出后，等待所有任务退出的最长时间（默认 60 秒）
    ///
    /// 超时仍未退出的任务会被强制中止。
    #[serde(with = "crate::config::duration_str")]
    pub shutdown_timeout: Duration,
    /// 是否监听 SIGINT / SIGTERM（默认 true）
    pub handle_os_signals: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(60),
            handle_os_signals: true,
        }
    }
}

impl RuntimeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置关闭超时时间
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// 启用/禁用操作系统信号监听
    pub fn with_os_signals(mut self, enable: bool) -> Self {
        self.handle_os_signals = enable;
        self
    }
}
