//! # tracing 订阅器初始化
//!
//! - **意图（Why）**：库本身只通过 `tracing` 宏发出事件；进程入口（服务、演示程序、集成测试）
//!   需要一行代码把事件输出到终端；
//! - **逻辑（How）**：组装 `fmt` Layer 与 [`EnvFilter`]，优先读取 `RUST_LOG`，否则使用调用方给出的过滤串；
//! - **契约（What）**：全局订阅器已存在时返回 [`ObservabilityError::AlreadyInstalled`]，不会 panic。

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装订阅器失败。
#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("invalid log filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// 安装全局 `fmt` 订阅器；`default_filter` 形如 `"info,rivulet_core=debug"`。
pub fn init_tracing(default_filter: &str) -> Result<(), ObservabilityError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter).map_err(|err| {
            ObservabilityError::InvalidFilter {
                filter: default_filter.to_owned(),
                reason: err.to_string(),
            }
        })?,
    };
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| ObservabilityError::AlreadyInstalled)
}
