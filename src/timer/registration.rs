//! 到期注册
//! Expiry registration
//!
//! 每个需要期限跟踪的客户端拥有一个 [`ExpiryRegistration`]，它把客户端与
//! [`TimeoutManager`] 连接起来，并保证同一时刻最多只有一个挂起条目。
//! 同一个注册可以在多次注册/注销周期中复用。
//!
//! Every client needing deadline tracking owns one [`ExpiryRegistration`]. It
//! bridges the client to the [`TimeoutManager`] and guarantees at most one
//! pending entry at a time. A registration is reused across many
//! register/unregister cycles.

use super::manager::TimeoutManager;
use super::tree::EntryHandle;
use crate::clock::duration_us;
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::trace;

/// 具备超时能力的客户端
/// Timeout-capable client
pub trait TimeoutClient {
    /// 客户端的期限已到。
    ///
    /// 调用时条目已经从管理器中移除，因此可以在这里安全地重新注册。
    /// 不得在此回调中阻塞或挂起。
    ///
    /// The client's deadline has passed. The entry has already been removed
    /// from the manager, so re-registering from here is safe. Must not block
    /// or suspend.
    fn timeout(&self);
}

/// 注册的进程内唯一标识
/// Process-local registration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl RegistrationId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration-{}", self.0)
    }
}

/// 注册与管理器共享的状态
/// State shared between a registration and the manager
///
/// 不变式：`entry.is_some()` 当且仅当管理器的反向映射中存在该条目。
/// Invariant: `entry.is_some()` iff the manager's reverse map holds the entry.
pub(crate) struct RegistrationSlot {
    pub(crate) id: RegistrationId,
    pub(crate) client: Weak<dyn TimeoutClient>,
    pub(crate) entry: Cell<Option<EntryHandle>>,
    /// 每次注册或注销时递增；投递前用它检测快照之后的变化
    /// Bumped on every register and unregister; delivery uses it to detect
    /// changes made after the snapshot
    pub(crate) epoch: Cell<u64>,
}

/// 到期注册
/// Expiry registration
///
/// 状态机：`Unregistered → register → Registered → (unregister | 触发/fires) → Unregistered`。
/// 释放时自动注销。
/// Dropping a registration unregisters it.
pub struct ExpiryRegistration {
    slot: Rc<RegistrationSlot>,
    manager: TimeoutManager,
}

impl fmt::Debug for ExpiryRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryRegistration")
            .field("id", &self.slot.id)
            .field("entry", &self.slot.entry.get())
            .finish()
    }
}

impl ExpiryRegistration {
    /// 为客户端创建注册。注册只持有客户端的弱引用，因此客户端可以拥有自己的注册。
    ///
    /// Create a registration for a client. Only a weak reference is held, so
    /// the client may own its own registration (see [`Rc::new_cyclic`]).
    pub fn new(manager: &TimeoutManager, client: Weak<dyn TimeoutClient>) -> Self {
        let slot = RegistrationSlot {
            id: manager.next_registration_id(),
            client,
            entry: Cell::new(None),
            epoch: Cell::new(0),
        };
        Self {
            slot: Rc::new(slot),
            manager: manager.clone(),
        }
    }

    /// 为已经由 `Rc` 持有的客户端创建注册
    /// Create a registration for a client already held in an `Rc`
    pub fn for_client<C: TimeoutClient + 'static>(manager: &TimeoutManager, client: &Rc<C>) -> Self {
        let weak: Weak<C> = Rc::downgrade(client);
        Self::new(manager, weak)
    }

    /// 在 `timeout_us` 微秒后到期。
    ///
    /// `timeout_us == 0` 被拒绝并返回 `false`，不会创建条目：
    /// 零超时与"已经到期"无法区分。
    ///
    /// Expire `timeout_us` microseconds from now. `timeout_us == 0` is rejected
    /// with `false` and no entry is created: a zero timeout is indistinguishable
    /// from "already due".
    ///
    /// # Panics
    ///
    /// 已经注册时调用是前置条件违规。
    /// Calling while already registered is a precondition violation.
    #[track_caller]
    pub fn register(&self, timeout_us: u64) -> bool {
        if timeout_us == 0 {
            trace!(registration = %self.slot.id, "Ignoring zero timeout");
            return false;
        }
        self.manager.register(self, timeout_us);
        true
    }

    /// 以 `Duration` 表示的 [`register`](Self::register)；不足一微秒的时长视为零
    /// [`register`](Self::register) with a `Duration`; sub-microsecond durations count as zero
    #[track_caller]
    pub fn register_after(&self, timeout: Duration) -> bool {
        self.register(duration_us(timeout))
    }

    /// 注销；未注册时返回 `false`
    ///
    /// 如果本注册已在进行中的 `check_timeouts` 快照里但尚未被投递，
    /// 那次投递也会被取消。
    ///
    /// Unregister; returns `false` when not registered. If this registration
    /// sits in the snapshot of a `check_timeouts` pass in progress and has not
    /// been delivered yet, that delivery is cancelled as well.
    pub fn unregister(&self) -> bool {
        match self.slot.entry.get() {
            Some(handle) => {
                self.manager.unregister(handle);
                true
            }
            None => {
                self.slot.epoch.set(self.slot.epoch.get() + 1);
                false
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.slot.entry.get().is_some()
    }

    /// 当前挂起条目的到期时间
    /// Expiry of the pending entry
    pub fn expiry_us(&self) -> Option<u64> {
        self.slot
            .entry
            .get()
            .and_then(|handle| self.manager.expiry_of(handle))
    }

    pub fn entry(&self) -> Option<EntryHandle> {
        self.slot.entry.get()
    }

    pub fn id(&self) -> RegistrationId {
        self.slot.id
    }

    pub fn manager(&self) -> &TimeoutManager {
        &self.manager
    }

    pub(crate) fn slot(&self) -> &Rc<RegistrationSlot> {
        &self.slot
    }
}

impl Drop for ExpiryRegistration {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.entry.get() {
            // 条目由本注册独占，因此注销不会失败
            // The entry is owned by this registration, so this cannot fail
            let _ = self.manager.try_unregister(handle);
        }
    }
}
