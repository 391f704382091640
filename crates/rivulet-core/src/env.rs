//! 适配器运行所需的外部环境：Tokio 运行时句柄与默认事件调度器。

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::{
    dispatcher::{SharedDispatcher, SyncDispatcher},
    error::TransportError,
};

/// 原生驱动所在的运行时与默认调度器。
#[derive(Clone, Debug)]
pub struct Environment {
    runtime: Handle,
    events: SharedDispatcher,
}

impl Environment {
    pub fn new(runtime: Handle, events: SharedDispatcher) -> Self {
        Self { runtime, events }
    }

    /// 捕获当前线程所在的 Tokio 运行时；不在运行时内调用时返回生命周期错误。
    pub fn current() -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|_| {
            TransportError::invalid_state("environment", "no tokio runtime on this thread")
        })?;
        Ok(Self::new(runtime, SyncDispatcher::shared()))
    }

    /// 替换默认事件调度器。
    pub fn with_events(mut self, events: SharedDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn events(&self) -> SharedDispatcher {
        Arc::clone(&self.events)
    }
}
