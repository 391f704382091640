//! 读/写空闲检测。
//!
//! 每次注册启动一个运行在 Tokio 上的观察任务：截止时间到达且期间没有活动时触发一次，
//! 随后等待下一次活动再重新计时；通道关闭后任务退出。空闲本身不会关闭通道。

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, watch},
    time::{Instant, sleep_until},
};

/// 单方向（读或写）的活动时钟。
#[derive(Debug)]
pub(crate) struct ActivityClock {
    ticks: AtomicU64,
    last: Mutex<Instant>,
    notify: Notify,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            last: Mutex::new(Instant::now()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last.lock() = Instant::now();
        self.ticks.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn last(&self) -> Instant {
        *self.last.lock()
    }
}

pub(crate) async fn watch_idle<F>(
    clock: Arc<ActivityClock>,
    timeout: Duration,
    mut closed: watch::Receiver<bool>,
    fire: F,
) where
    F: Fn() + Send + 'static,
{
    let mut armed = Instant::now();
    loop {
        let deadline = clock.last().max(armed) + timeout;
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = closed.wait_for(|closed| *closed) => return,
        }
        if clock.last().max(armed) + timeout > Instant::now() {
            continue;
        }

        let seen = clock.ticks();
        fire();

        let notified = clock.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if clock.ticks() == seen {
            tokio::select! {
                _ = &mut notified => {}
                _ = closed.wait_for(|closed| *closed) => return,
            }
        }
        armed = Instant::now();
    }
}
