//! # 适配器生命周期守卫
//!
//! ## 意图（Why）
//! - `start()`/`shutdown()` 不可重入：重复启动、启动前关闭都必须以显式的生命周期错误
//!   返回给调用方，而不是静默空操作；
//! - 绑定失败后不得残留“正在监听”的半状态，适配器应可以再次尝试启动。
//!
//! ## 逻辑（How）
//! - 以 `AtomicU8` 表示 `Idle → Starting → Running → Stopping → Stopped` 五态；
//! - 每个迁移都是一次 CAS，失败时返回描述当前状态的 [`TransportError::InvalidState`]。

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::TransportError;

/// 适配器所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Idle => "not started",
            Self::Starting => "start in progress",
            Self::Running => "already started",
            Self::Stopping => "shutdown in progress",
            Self::Stopped => "already shut down",
        }
    }
}

/// 生命周期状态机。
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Idle as u8),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// `Idle → Starting`。
    pub fn begin_start(&self) -> Result<(), TransportError> {
        self.transition(LifecycleState::Idle, LifecycleState::Starting, "start")
    }

    /// `Starting → Running`。
    pub fn started(&self) {
        let _ = self.transition(LifecycleState::Starting, LifecycleState::Running, "start");
    }

    /// 启动失败：`Starting → Idle`，允许重试。
    pub fn start_failed(&self) {
        let _ = self.transition(LifecycleState::Starting, LifecycleState::Idle, "start");
    }

    /// `Running → Stopping`；未启动或已关闭时返回错误。
    pub fn begin_shutdown(&self) -> Result<(), TransportError> {
        self.transition(LifecycleState::Running, LifecycleState::Stopping, "shutdown")
    }

    /// `Stopping → Stopped`。
    pub fn stopped(&self) {
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::Release);
    }

    /// 要求处于运行态，供 `join`/`send` 等启动后才可用的操作使用。
    pub fn ensure_running(&self, operation: &'static str) -> Result<(), TransportError> {
        let state = self.state();
        if state == LifecycleState::Running {
            Ok(())
        } else {
            Err(TransportError::invalid_state(operation, state.describe()))
        }
    }

    fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        operation: &'static str,
    ) -> Result<(), TransportError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                TransportError::invalid_state(operation, LifecycleState::from_u8(actual).describe())
            })
    }
}
