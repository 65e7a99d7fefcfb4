//! 微服务运行时框架
//!
//! 托管一个 [`CloudService`](crate::service::CloudService) 从初始化到停机的完整生命周期。
//!
//! # 设计理念
//!
//! 1. **能力即任务**：REST、RPC、每个事件订阅各自对应一组 [`Task`]
//! 2. **共享取消**：所有任务共用一个 `CancellationToken`，任一任务失败或收到停机信号都会触发它
//! 3. **并发任务管理**：使用 `JoinSet` 管理所有任务
//! 4. **有界停机**：取消之后的等待受 `shutdown_timeout` 限制，超时的任务被强制中止
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use compass_service_core::config::ServiceConfig;
//! use compass_service_core::runtime::ServiceRuntime;
//! use compass_service_core::service::BaseService;
//!
//! # async fn example() -> compass_service_core::Result<()> {
//! let config = ServiceConfig::load_from_file("service.toml")?.apply_env()?;
//! ServiceRuntime::from_config(&config)
//!     .run(BaseService::new())
//!     .await
//! # }
//! ```

pub mod config;
pub mod runtime;
pub mod signal;
pub mod task;

pub use config::RuntimeConfig;
pub use runtime::{RuntimeState, ServiceRuntime};
pub use task::{SpawnTask, SubscriptionTask, Task, TaskFuture, TaskResult};
