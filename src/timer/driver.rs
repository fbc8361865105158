//! 反应器侧定时器驱动
//! Reactor-side timer driver
//!
//! 该模块在tokio之上实现 [`TimerHook`]：一个本地任务休眠到已设置的期限，
//! 然后调用 [`TimeoutManager::check_timeouts_now`]。重新设置期限通过
//! `Notify` 唤醒该任务。
//!
//! This module implements [`TimerHook`] on top of tokio: a local task sleeps
//! until the armed deadline and then calls
//! [`TimeoutManager::check_timeouts_now`]. Re-arming wakes the task through a
//! `Notify`.

use super::manager::{TimeoutManager, TimerHook};
use crate::config::TimerConfig;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

#[derive(Debug, Default)]
struct DriverShared {
    deadline: Cell<Option<u64>>,
    closed: Cell<bool>,
    wakeups: Cell<u64>,
    notify: Notify,
}

/// 安装到管理器上的钩子
/// Hook installed on the manager
struct DriverHook {
    shared: Rc<DriverShared>,
}

impl TimerHook for DriverHook {
    fn set_timeout(&self, expiry_us: u64) {
        self.shared.deadline.set(Some(expiry_us));
        self.shared.notify.notify_one();
    }

    fn stop_timeout(&self) {
        self.shared.deadline.set(None);
        self.shared.notify.notify_one();
    }
}

/// 定时器驱动句柄
/// Timer driver handle
#[derive(Debug)]
pub struct TimerDriverHandle {
    shared: Rc<DriverShared>,
    manager: TimeoutManager,
    task: JoinHandle<()>,
}

/// 启动定时器驱动。必须在 [`tokio::task::LocalSet`] 内调用。
///
/// Start the timer driver. Must be called from within a
/// [`tokio::task::LocalSet`].
pub fn spawn_timer_driver(manager: &TimeoutManager, config: &TimerConfig) -> TimerDriverHandle {
    let shared = Rc::new(DriverShared::default());
    manager.set_hook(Rc::new(DriverHook {
        shared: shared.clone(),
    }));

    let task = tokio::task::spawn_local(run(
        shared.clone(),
        manager.clone(),
        config.driver_min_sleep,
    ));
    info!("Timer driver started");

    TimerDriverHandle {
        shared,
        manager: manager.clone(),
        task,
    }
}

async fn run(shared: Rc<DriverShared>, manager: TimeoutManager, min_sleep: Duration) {
    loop {
        if shared.closed.get() {
            break;
        }
        let Some(deadline) = shared.deadline.get() else {
            shared.notify.notified().await;
            continue;
        };

        let now = manager.now_us();
        if deadline > now {
            let wait = Duration::from_micros(deadline - now).max(min_sleep);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shared.notify.notified() => {
                    // 期限已改变，重新计算
                    // Deadline changed, recompute
                    continue;
                }
            }
        }

        shared.wakeups.set(shared.wakeups.get() + 1);
        let fired = manager.check_timeouts_now();
        trace!(deadline, fired, "Timer driver woke up");
    }
    debug!("Timer driver stopped");
}

impl TimerDriverHandle {
    /// 驱动被唤醒并检查超时的次数
    /// Number of times the driver woke up to check timeouts
    pub fn wakeups(&self) -> u64 {
        self.shared.wakeups.get()
    }

    /// 当前设置的期限
    /// Currently armed deadline
    pub fn armed_deadline(&self) -> Option<u64> {
        self.shared.deadline.get()
    }

    /// 停止驱动任务并卸载钩子
    /// Stop the driver task and uninstall the hook
    pub async fn shutdown(self) {
        self.shared.closed.set(true);
        self.shared.notify.notify_one();
        self.manager.clear_hook();
        let _ = self.task.await;
        info!("Timer driver shut down");
    }
}
