//! 周期定时器
//! Periodic timer
//!
//! 在超时管理器之上的应用级重复回调：每次触发后在 `timeout()` 内部重新注册自身。
//!
//! Application-level repeating callback on top of the timeout manager: after
//! each firing it re-registers itself from inside `timeout()`.

use super::error::TimerError;
use super::manager::TimeoutManager;
use super::registration::{ExpiryRegistration, TimeoutClient};
use crate::clock::duration_us;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// 回调的返回值，决定定时器是否继续
/// Callback result deciding whether the timer keeps running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Continue,
    Stop,
}

type TickCallback = Box<dyn FnMut(u64) -> TimerAction>;

struct PeriodicClient {
    interval_us: Cell<u64>,
    ticks: Cell<u64>,
    stopped: Cell<bool>,
    callback: RefCell<TickCallback>,
    registration: ExpiryRegistration,
}

impl TimeoutClient for PeriodicClient {
    fn timeout(&self) {
        if self.stopped.get() {
            return;
        }
        let tick = self.ticks.get() + 1;
        self.ticks.set(tick);

        let action = match self.callback.try_borrow_mut() {
            Ok(mut callback) => callback(tick),
            Err(_) => {
                warn!(registration = %self.registration.id(), tick, "Periodic callback re-entered, skipping tick");
                TimerAction::Continue
            }
        };

        match action {
            TimerAction::Continue if !self.stopped.get() => {
                // 回调可能已经自行重新注册
                // The callback may already have re-registered
                if !self.registration.is_registered() {
                    self.registration.register(self.interval_us.get());
                }
            }
            _ => {
                self.stopped.set(true);
                debug!(registration = %self.registration.id(), tick, "Periodic timer stopped");
            }
        }
    }
}

/// 周期定时器
/// Periodic timer
///
/// 释放时停止。
/// Stops when dropped.
pub struct PeriodicTimer {
    client: Rc<PeriodicClient>,
}

impl fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("interval_us", &self.client.interval_us.get())
            .field("ticks", &self.client.ticks.get())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicTimer {
    /// 启动一个每 `interval_us` 微秒触发一次的定时器。回调收到从1开始的触发序号。
    ///
    /// Start a timer firing every `interval_us` microseconds. The callback
    /// receives the 1-based tick number.
    pub fn start<F>(manager: &TimeoutManager, interval_us: u64, callback: F) -> Result<Self, TimerError>
    where
        F: FnMut(u64) -> TimerAction + 'static,
    {
        if interval_us == 0 {
            return Err(TimerError::ZeroInterval);
        }
        let client = Rc::new_cyclic(|weak: &Weak<PeriodicClient>| {
            let weak: Weak<dyn TimeoutClient> = weak.clone();
            PeriodicClient {
                interval_us: Cell::new(interval_us),
                ticks: Cell::new(0),
                stopped: Cell::new(false),
                callback: RefCell::new(Box::new(callback)),
                registration: ExpiryRegistration::new(manager, weak),
            }
        });
        client.registration.register(interval_us);
        debug!(registration = %client.registration.id(), interval_us, "Periodic timer started");
        Ok(Self { client })
    }

    /// 以 `Duration` 表示间隔的 [`start`](Self::start)
    /// [`start`](Self::start) with a `Duration` interval
    pub fn start_every<F>(manager: &TimeoutManager, interval: Duration, callback: F) -> Result<Self, TimerError>
    where
        F: FnMut(u64) -> TimerAction + 'static,
    {
        let interval_us = duration_us(interval);
        Self::start(manager, interval_us, callback)
    }

    /// 停止定时器；如果它之前仍在运行则返回 `true`
    /// Stop the timer; returns `true` if it was still running
    pub fn stop(&self) -> bool {
        let was_running = !self.client.stopped.replace(true);
        self.client.registration.unregister();
        was_running
    }

    pub fn is_running(&self) -> bool {
        !self.client.stopped.get() && self.client.registration.is_registered()
    }

    /// 已触发次数
    /// Number of ticks fired so far
    pub fn ticks(&self) -> u64 {
        self.client.ticks.get()
    }

    pub fn interval_us(&self) -> u64 {
        self.client.interval_us.get()
    }

    /// 修改间隔；在下一次重新设置时生效
    /// Change the interval; takes effect at the next re-arm
    pub fn set_interval(&self, interval_us: u64) -> Result<(), TimerError> {
        if interval_us == 0 {
            return Err(TimerError::ZeroInterval);
        }
        self.client.interval_us.set(interval_us);
        Ok(())
    }

    /// 下一次触发时间
    /// Next firing time
    pub fn next_fire_us(&self) -> Option<u64> {
        self.client.registration.expiry_us()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
