//! 连接空闲超时
//! Connection idle timeout
//!
//! 基于 [`ExpiryRegistration`] 的单连接空闲期限。期限到期时终止处理器的挂起点；
//! 服务逻辑通过 `touch()` 在每次活动后推迟期限。
//!
//! Per-connection idle deadline built on an [`ExpiryRegistration`]. When it
//! expires the handler's suspension point is killed; the service body pushes
//! the deadline back with `touch()` after each activity.

use super::core::HandlerId;
use super::suspend::{KillReason, KillSwitch};
use crate::clock::duration_us;
use crate::timer::{ExpiryRegistration, TimeoutClient, TimeoutManager};
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

struct IdleClient {
    handler: HandlerId,
    kill: KillSwitch,
    fired: Cell<bool>,
    registration: ExpiryRegistration,
}

impl TimeoutClient for IdleClient {
    fn timeout(&self) {
        self.fired.set(true);
        debug!(handler = %self.handler, "Idle deadline expired, killing handler");
        self.kill.kill_with(KillReason::IdleTimeout);
    }
}

/// 空闲超时
/// Idle timeout
///
/// 释放时注销。
/// Unregisters when dropped.
pub struct IdleTimeout {
    client: Rc<IdleClient>,
    timeout_us: u64,
}

impl fmt::Debug for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimeout")
            .field("handler", &self.client.handler)
            .field("timeout_us", &self.timeout_us)
            .field("armed", &self.is_armed())
            .field("fired", &self.has_fired())
            .finish()
    }
}

impl IdleTimeout {
    pub fn new(manager: &TimeoutManager, timeout: Duration, kill: KillSwitch, handler: HandlerId) -> Self {
        let client = Rc::new_cyclic(|weak: &Weak<IdleClient>| {
            let weak: Weak<dyn TimeoutClient> = weak.clone();
            IdleClient {
                handler,
                kill,
                fired: Cell::new(false),
                registration: ExpiryRegistration::new(manager, weak),
            }
        });
        Self {
            client,
            timeout_us: duration_us(timeout),
        }
    }

    /// 从现在开始计时；已设置时重新开始。零时长的超时永远不会被设置。
    ///
    /// Start the countdown from now, restarting it when already armed. A
    /// zero-length timeout is never armed.
    pub fn arm(&self) -> bool {
        self.client.registration.unregister();
        self.client.registration.register(self.timeout_us)
    }

    /// 记录一次活动，推迟期限；未设置时（例如已经到期）不做任何事
    /// Record activity, pushing the deadline back; does nothing when not armed
    /// (e.g. it already fired)
    pub fn touch(&self) -> bool {
        if !self.client.registration.is_registered() {
            return false;
        }
        self.arm()
    }

    pub fn disarm(&self) -> bool {
        self.client.registration.unregister()
    }

    pub fn is_armed(&self) -> bool {
        self.client.registration.is_registered()
    }

    pub fn has_fired(&self) -> bool {
        self.client.fired.get()
    }

    /// 距期限还剩多少时间
    /// Time left until the deadline
    pub fn remaining(&self) -> Option<Duration> {
        let expiry_us = self.client.registration.expiry_us()?;
        let now_us = self.client.registration.manager().now_us();
        Some(Duration::from_micros(expiry_us.saturating_sub(now_us)))
    }
}
