//! 超时管理器实现
//! Timeout Manager Implementation
//!
//! 该模块实现了单线程的超时管理器：它拥有到期树以及从条目句柄到注册的反向映射，
//! 负责注册、注销和批量超时检查，并通过可插拔的钩子让反应器设置实际的操作系统定时器。
//!
//! This module implements the single-threaded timeout manager. It owns the
//! expiry tree plus the reverse map from entry handle to registration, handles
//! register/unregister and batched timeout checks, and delegates arming of the
//! real OS timer to a pluggable hook implemented by the reactor.

use super::error::TimerError;
use super::registration::{ExpiryRegistration, RegistrationId, RegistrationSlot};
use super::tree::{EntryHandle, ExpiryTree};
use crate::clock::{Clock, SystemClock};
use crate::config::TimerConfig;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// 没有待处理条目时返回的"无穷"哨兵值
/// "Infinite" sentinel returned when nothing is pending
pub const NO_EXPIRATION: u64 = u64::MAX;

/// 反应器定时器钩子
/// Reactor timer hook
///
/// 管理器只在最小到期时间变化时调用钩子，并且从不在持有内部状态借用时调用。
/// The manager only calls the hook when the minimum expiry changes, and never
/// while its internal state is borrowed.
pub trait TimerHook {
    /// 将单次定时器设置为在绝对时间 `expiry_us` 触发
    /// Arm the single-shot timer to fire at absolute time `expiry_us`
    fn set_timeout(&self, expiry_us: u64);

    /// 撤销定时器
    /// Disarm the timer
    fn stop_timeout(&self);
}

/// 不做任何事的钩子，用于由调用方自行轮询 `check_timeouts` 的场景
/// Hook that does nothing, for callers that poll `check_timeouts` themselves
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl TimerHook for NoopHook {
    fn set_timeout(&self, _expiry_us: u64) {}
    fn stop_timeout(&self) {}
}

/// 超时管理器统计信息
/// Timeout manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutManagerStats {
    /// 当前挂起的注册数
    /// Currently pending registrations
    pub pending: usize,
    /// 累计注册次数
    /// Total registrations
    pub registered: u64,
    /// 在到期前取消的次数
    /// Registrations cancelled before expiry
    pub cancelled: u64,
    /// 已投递的超时数
    /// Timeouts delivered
    pub fired: u64,
    /// 因客户端已释放而跳过的超时数
    /// Expired entries skipped because the client was already dropped
    pub dropped_clients: u64,
    /// 因在快照之后被重新注册或注销而跳过的超时数
    /// Expired entries skipped because they were re-registered or
    /// unregistered after the snapshot
    pub superseded: u64,
    /// `check_timeouts` 调用次数
    /// Number of `check_timeouts` passes
    pub check_passes: u64,
    /// 钩子设置次数
    /// Hook arm calls
    pub hook_arms: u64,
    /// 钩子撤销次数
    /// Hook disarm calls
    pub hook_disarms: u64,
}

impl fmt::Display for TimeoutManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeoutManagerStats {{ pending: {}, registered: {}, cancelled: {}, fired: {}, dropped: {}, superseded: {}, passes: {}, arms: {}, disarms: {} }}",
            self.pending,
            self.registered,
            self.cancelled,
            self.fired,
            self.dropped_clients,
            self.superseded,
            self.check_passes,
            self.hook_arms,
            self.hook_disarms
        )
    }
}

/// 在释放借用之后才执行的钩子动作
/// Hook action applied only after the state borrow is released
enum HookAction {
    Keep,
    Set(Rc<dyn TimerHook>, u64),
    Stop(Rc<dyn TimerHook>),
}

struct ManagerState {
    tree: ExpiryTree,
    /// 条目句柄到注册的反向映射，与树一一对应
    /// Reverse map from entry handle to registration, one-to-one with the tree
    reverse: HashMap<EntryHandle, Rc<RegistrationSlot>>,
    hook: Rc<dyn TimerHook>,
    /// 最近一次交给钩子的到期时间
    /// Expiry most recently handed to the hook
    armed: Option<u64>,
    /// 正在进行的投递轮数；非零时合并钩子调用
    /// Delivery passes in progress; hook calls are coalesced while non-zero
    delivering: u32,
    next_registration_id: u64,
    stats: TimeoutManagerStats,
}

impl ManagerState {
    /// 计算把钩子同步到当前最小到期时间所需的动作
    /// Compute the action needed to sync the hook with the current minimum
    fn sync_hook(&mut self) -> HookAction {
        if self.delivering > 0 {
            return HookAction::Keep;
        }
        let desired = self.tree.first().map(|(_, expiry_us)| expiry_us);
        if desired == self.armed {
            return HookAction::Keep;
        }
        self.armed = desired;
        match desired {
            Some(expiry_us) => {
                self.stats.hook_arms += 1;
                HookAction::Set(self.hook.clone(), expiry_us)
            }
            None => {
                self.stats.hook_disarms += 1;
                HookAction::Stop(self.hook.clone())
            }
        }
    }
}

/// 超时管理器
/// Timeout manager
///
/// 这是一个可廉价克隆的进程内句柄；所有克隆共享同一棵到期树。
/// 它是 `!Send` 的：所有操作都在唯一的反应器线程上进行。
///
/// A cheap-to-clone, process-local handle; all clones share one expiry tree.
/// It is `!Send`: every operation happens on the single reactor thread.
#[derive(Clone)]
pub struct TimeoutManager {
    state: Rc<RefCell<ManagerState>>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TimeoutManager");
        match self.state.try_borrow() {
            Ok(state) => s
                .field("pending", &state.tree.len())
                .field("armed", &state.armed),
            Err(_) => s.field("state", &"<borrowed>"),
        };
        s.field("clock", &self.clock).finish()
    }
}

impl TimeoutManager {
    /// 使用给定时钟创建管理器
    /// Create manager with the given clock
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self::with_config(&TimerConfig::default(), clock)
    }

    /// 使用系统时钟和默认配置创建管理器
    /// Create manager with the system clock and default configuration
    pub fn new_default() -> Self {
        Self::new(SystemClock::new())
    }

    pub fn with_config(config: &TimerConfig, clock: impl Clock + 'static) -> Self {
        let state = ManagerState {
            tree: ExpiryTree::with_capacity(config.initial_capacity),
            reverse: HashMap::with_capacity(config.initial_capacity),
            hook: Rc::new(NoopHook),
            armed: None,
            delivering: 0,
            next_registration_id: 1,
            stats: TimeoutManagerStats::default(),
        };
        Self {
            state: Rc::new(RefCell::new(state)),
            clock: Rc::new(clock),
        }
    }

    /// 安装反应器钩子；新钩子会立即被设置为当前最小到期时间
    /// Install the reactor hook; it is immediately armed with the current minimum
    pub fn set_hook(&self, hook: Rc<dyn TimerHook>) {
        let action = {
            let mut state = self.state.borrow_mut();
            state.hook = hook;
            state.armed = None;
            state.sync_hook()
        };
        apply(action);
    }

    /// 卸载钩子，换回 [`NoopHook`]
    /// Uninstall the hook, reverting to [`NoopHook`]
    pub fn clear_hook(&self) {
        let mut state = self.state.borrow_mut();
        state.hook = Rc::new(NoopHook);
        state.armed = None;
    }

    /// 当前时间（微秒）
    /// Current time in microseconds
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub(crate) fn next_registration_id(&self) -> RegistrationId {
        let mut state = self.state.borrow_mut();
        let id = state.next_registration_id;
        state.next_registration_id += 1;
        RegistrationId(id)
    }

    /// 为注册在 `now() + timeout_us` 处插入一个到期条目
    /// Insert an expiry entry at `now() + timeout_us` for the registration
    ///
    /// # Panics
    ///
    /// 如果注册属于另一个管理器、已经处于注册状态，或 `timeout_us` 为零（零超时由
    /// [`ExpiryRegistration::register`] 拒绝，不会到达这里）。
    ///
    /// If the registration belongs to another manager, is already registered,
    /// or if `timeout_us` is zero
    /// (zero timeouts are rejected by [`ExpiryRegistration::register`] before
    /// reaching the manager).
    #[track_caller]
    pub(crate) fn register(&self, registration: &ExpiryRegistration, timeout_us: u64) -> EntryHandle {
        assert!(timeout_us > 0, "zero timeout must be rejected before registering");
        assert!(
            Rc::ptr_eq(&self.state, &registration.manager().state),
            "{} belongs to a different timeout manager",
            registration.id()
        );
        let slot = registration.slot();
        assert!(
            slot.entry.get().is_none(),
            "{} is already registered",
            slot.id
        );

        let expiry_us = self.clock.now_us().saturating_add(timeout_us);
        let (handle, action) = {
            let mut state = self.state.borrow_mut();
            let handle = state.tree.add(expiry_us);
            state.reverse.insert(handle, slot.clone());
            slot.entry.set(Some(handle));
            slot.epoch.set(slot.epoch.get() + 1);
            state.stats.registered += 1;
            (handle, state.sync_hook())
        };
        apply(action);

        trace!(registration = %slot.id, %handle, timeout_us, expiry_us, "Registered timeout");
        handle
    }

    /// 注销一个条目，返回它的到期时间
    /// Unregister an entry, returning its expiry time
    ///
    /// # Panics
    ///
    /// 句柄未注册时（例如二次注销）。
    ///
    /// When the handle is not registered (e.g. a double unregister).
    #[track_caller]
    pub fn unregister(&self, handle: EntryHandle) -> u64 {
        match self.try_unregister(handle) {
            Ok(expiry_us) => expiry_us,
            Err(e) => panic!("unregister of unknown expiry entry: {e}"),
        }
    }

    /// [`unregister`](Self::unregister) 的可检查版本
    /// Checked variant of [`unregister`](Self::unregister)
    pub fn try_unregister(&self, handle: EntryHandle) -> Result<u64, TimerError> {
        let (expiry_us, action) = {
            let mut state = self.state.borrow_mut();
            let expiry_us = state.tree.remove(handle)?;
            if let Some(slot) = state.reverse.remove(&handle) {
                slot.entry.set(None);
                slot.epoch.set(slot.epoch.get() + 1);
                trace!(registration = %slot.id, %handle, expiry_us, "Unregistered timeout");
            }
            state.stats.cancelled += 1;
            (expiry_us, state.sync_hook())
        };
        apply(action);
        Ok(expiry_us)
    }

    /// 投递所有 `expiry <= now_us` 的超时，返回实际超时的客户端数量
    /// Deliver every timeout with `expiry <= now_us`; returns the number of clients timed out
    pub fn check_timeouts(&self, now_us: u64) -> usize {
        self.check_timeouts_with(now_us, |_| true)
    }

    /// 以管理器时钟的当前时间执行 [`check_timeouts`](Self::check_timeouts)
    /// [`check_timeouts`](Self::check_timeouts) at the manager clock's current time
    pub fn check_timeouts_now(&self) -> usize {
        self.check_timeouts(self.clock.now_us())
    }

    /// 带访问者的超时检查
    /// Timeout check with a visitor
    ///
    /// 1. 快照所有 `expiry <= now_us` 的条目；
    /// 2. 在任何投递之前先注销所有快照条目；
    /// 3. 按到期顺序投递 `timeout()`；访问者返回 `false` 时停止投递剩余条目
    ///    （它们已经被注销，只是不再投递）；
    /// 4. 所有投递结束后只重新设置一次钩子。
    ///
    /// 1. snapshot every entry with `expiry <= now_us`;
    /// 2. unregister every snapshotted entry before any delivery;
    /// 3. deliver `timeout()` in expiry order; when the visitor returns `false`
    ///    the remaining entries are not delivered (they stay unregistered);
    /// 4. re-arm the hook once, after all deliveries.
    ///
    /// 客户端在 `timeout()` 中重新注册是安全的：它得到的新条目不在快照中，
    /// 不会在本轮被再次访问。
    ///
    /// A client may re-register from inside `timeout()`: its new entry is not
    /// part of the snapshot and is not visited again in this pass.
    ///
    /// 如果某个快照条目的注册在投递到它之前被其他客户端的回调重新注册或注销，
    /// 它的这次超时被跳过：注册的当前状态优先于过时的快照。
    ///
    /// If a snapshotted registration is re-registered or unregistered by an
    /// earlier callback before its own delivery, that stale timeout is
    /// skipped: the registration's current state wins over the snapshot.
    pub fn check_timeouts_with<F>(&self, now_us: u64, mut visitor: F) -> usize
    where
        F: FnMut(RegistrationId) -> bool,
    {
        let batch = {
            let mut state = self.state.borrow_mut();
            state.stats.check_passes += 1;
            let expired = state.tree.expired(now_us);
            if expired.is_empty() {
                return 0;
            }

            let mut batch = Vec::with_capacity(expired.len());
            for (handle, _) in expired {
                if state.tree.remove(handle).is_err() {
                    continue;
                }
                if let Some(slot) = state.reverse.remove(&handle) {
                    slot.entry.set(None);
                    let epoch = slot.epoch.get() + 1;
                    slot.epoch.set(epoch);
                    batch.push((slot, epoch));
                }
            }
            state.delivering += 1;
            batch
        };

        let mut guard = DeliveryGuard {
            manager: self,
            delivered: 0,
            dropped: 0,
            superseded: 0,
        };
        for (slot, epoch) in &batch {
            if slot.epoch.get() != *epoch {
                debug!(registration = %slot.id, "Registration changed after snapshot, skipping");
                guard.superseded += 1;
                continue;
            }
            if !visitor(slot.id) {
                debug!(registration = %slot.id, "Visitor stopped timeout delivery");
                break;
            }
            match slot.client.upgrade() {
                Some(client) => {
                    trace!(registration = %slot.id, "Delivering timeout");
                    client.timeout();
                    guard.delivered += 1;
                }
                None => {
                    debug!(registration = %slot.id, "Timeout client already dropped, skipping");
                    guard.dropped += 1;
                }
            }
        }

        let delivered = guard.delivered;
        drop(guard);
        trace!(now_us, expired = batch.len(), delivered, "Checked timeouts");
        delivered
    }

    /// 下一个到期时间，没有条目时为 [`NO_EXPIRATION`]
    /// Next expiry time, or [`NO_EXPIRATION`] when empty
    pub fn next_expiration_us(&self) -> u64 {
        self.state
            .borrow()
            .tree
            .first()
            .map(|(_, expiry_us)| expiry_us)
            .unwrap_or(NO_EXPIRATION)
    }

    /// 距下一个到期还剩多少微秒；已过期时为0，没有条目时为 [`NO_EXPIRATION`]
    /// Microseconds until the next expiry; 0 when overdue, [`NO_EXPIRATION`] when empty
    pub fn us_left(&self) -> u64 {
        match self.next_expiration_us() {
            NO_EXPIRATION => NO_EXPIRATION,
            next => next.saturating_sub(self.clock.now_us()),
        }
    }

    /// 挂起的条目数
    /// Number of pending entries
    pub fn pending_count(&self) -> usize {
        self.state.borrow().tree.len()
    }

    pub fn is_registered(&self, handle: EntryHandle) -> bool {
        self.state.borrow().reverse.contains_key(&handle)
    }

    pub fn expiry_of(&self, handle: EntryHandle) -> Option<u64> {
        self.state.borrow().tree.expiry_of(handle)
    }

    /// 获取统计信息
    /// Get statistics
    pub fn stats(&self) -> TimeoutManagerStats {
        let state = self.state.borrow();
        TimeoutManagerStats {
            pending: state.tree.len(),
            ..state.stats.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.state.borrow();
        assert_eq!(state.tree.len(), state.reverse.len());
        for (handle, slot) in &state.reverse {
            assert!(state.tree.contains(*handle));
            assert_eq!(slot.entry.get(), Some(*handle));
        }
    }
}

/// 投递期间保持 `delivering` 计数，离开作用域时（包括回调 panic）结束投递并同步钩子
/// Holds the `delivering` count during delivery; on scope exit (including a
/// panicking callback) ends the pass and syncs the hook once
struct DeliveryGuard<'a> {
    manager: &'a TimeoutManager,
    delivered: usize,
    dropped: usize,
    superseded: usize,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        let action = {
            let mut state = self.manager.state.borrow_mut();
            state.delivering = state.delivering.saturating_sub(1);
            state.stats.fired += self.delivered as u64;
            state.stats.dropped_clients += self.dropped as u64;
            state.stats.superseded += self.superseded as u64;
            state.sync_hook()
        };
        apply(action);
    }
}

fn apply(action: HookAction) {
    match action {
        HookAction::Keep => {}
        HookAction::Set(hook, expiry_us) => {
            trace!(expiry_us, "Arming reactor timer");
            hook.set_timeout(expiry_us);
        }
        HookAction::Stop(hook) => {
            trace!("Disarming reactor timer");
            hook.stop_timeout();
        }
    }
}
