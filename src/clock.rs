//! 时钟抽象
//! Clock abstraction
//!
//! 所有到期时间都以UNIX纪元以来的微秒表示。生产时钟在构造时锚定到墙上时钟，
//! 之后由tokio单调时钟推进，因此不会因系统时间调整而倒退。
//!
//! All expiry times are expressed as microseconds since the UNIX epoch. The
//! production clock is anchored to the wall clock when it is built and is then
//! advanced by the tokio monotonic clock, so it never runs backwards when the
//! system time is adjusted.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// 微秒时间源
/// Microsecond time source
pub trait Clock: fmt::Debug {
    /// 当前时间，UNIX纪元以来的微秒数
    /// Current time in microseconds since the UNIX epoch
    fn now_us(&self) -> u64;
}

/// 锚定到墙上时钟的单调时钟
/// Monotonic clock anchored to the wall clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_us: u64,
    anchor: Instant,
}

/// 以微秒表示的时长，超出 `u64` 时饱和
/// Duration in microseconds, saturating at `u64::MAX`
pub(crate) fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl SystemClock {
    /// 创建新的系统时钟
    /// Create new system clock
    pub fn new() -> Self {
        let anchor_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_us)
            .unwrap_or(0);
        Self {
            anchor_us,
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.anchor_us
            .saturating_add(duration_us(self.anchor.elapsed()))
    }
}

/// 手动推进的时钟，用于确定性测试
/// Manually advanced clock for deterministic tests
///
/// Clones share the same time value.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_us)),
        }
    }

    /// 设置绝对时间
    /// Set absolute time
    pub fn set(&self, now_us: u64) {
        self.now.set(now_us);
    }

    /// 向前推进时间
    /// Advance time forward
    pub fn advance(&self, delta_us: u64) {
        self.now.set(self.now.get().saturating_add(delta_us));
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.get()
    }
}
