//! 定义了定时器、连接处理器和处理器池的可配置参数。
//! Defines configurable parameters for timers, connection handlers and the handler pool.

use crate::handler::SuspensionStrategy;
use std::time::Duration;

/// A structure containing all configurable parameters of the core.
///
/// 包含核心所有可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Timeout manager parameters.
    /// 超时管理器参数。
    pub timer: TimerConfig,

    /// Per-connection handler parameters.
    /// 单连接处理器参数。
    pub handler: HandlerConfig,

    /// Handler pool parameters.
    /// 处理器池参数。
    pub pool: PoolConfig,
}

/// Timeout manager parameters.
///
/// 超时管理器参数。
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Number of arena slots reserved up front by the expiry tree.
    /// 到期树预先保留的槽位数量。
    pub initial_capacity: usize,
    /// The shortest sleep the reactor-side driver performs before checking
    /// timeouts again. Deadlines closer than this are handled after this delay,
    /// which batches wakeups of many near-simultaneous deadlines.
    ///
    /// 反应器侧驱动在再次检查超时前的最短休眠时间。
    /// 比这更近的期限会在此延迟后处理，从而合并大量几乎同时的期限唤醒。
    pub driver_min_sleep: Duration,
}

/// Per-connection handler parameters.
///
/// 单连接处理器参数。
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How the handler body is suspended while it awaits I/O.
    /// 处理逻辑等待I/O时的挂起方式。
    pub strategy: SuspensionStrategy,
    /// Disconnect a connection after this long without activity.
    /// `None` disables idle disconnection.
    ///
    /// 连接在无活动达到此时长后断开。`None` 表示禁用空闲断开。
    pub idle_timeout: Option<Duration>,
    /// Attempt a clean `shutdown()` of a still-connected socket before closing it.
    /// 在关闭仍处于连接状态的套接字之前尝试执行干净的 `shutdown()`。
    pub graceful_shutdown: bool,
}

/// Handler pool parameters.
///
/// 处理器池参数。
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The maximum number of handlers alive at once (idle + active).
    /// 同时存活的处理器最大数量（空闲 + 活跃）。
    pub max_handlers: usize,
    /// Number of handlers created eagerly when the pool is built.
    /// 构建池时预先创建的处理器数量。
    pub prewarm: usize,
    /// How long the accept loop waits after a failed accept before retrying.
    /// 接受失败后接受循环在重试前等待的时长。
    pub accept_backoff: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            driver_min_sleep: Duration::from_millis(1),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            strategy: SuspensionStrategy::Task,
            idle_timeout: Some(Duration::from_secs(30)),
            graceful_shutdown: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_handlers: 256,
            prewarm: 0,
            accept_backoff: Duration::from_millis(10),
        }
    }
}
