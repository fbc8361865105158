//! 超时管理模块
//! Timeout Management Module
//!
//! 该模块实现了基于有序到期树的超时管理系统，以 O(log n) 的注册与取消
//! 跟踪每个客户端的期限，并通过可插拔钩子驱动反应器的单次定时器。
//!
//! This module implements a timeout management system built on an ordered
//! expiry tree. It tracks per-client deadlines with O(log n) registration and
//! cancellation, and drives the reactor's single-shot timer through a
//! pluggable hook.

pub mod driver;
pub mod error;
pub mod manager;
pub mod periodic;
pub mod registration;
pub mod tree;


pub use driver::{TimerDriverHandle, spawn_timer_driver};
pub use error::TimerError;
pub use manager::{NO_EXPIRATION, NoopHook, TimeoutManager, TimeoutManagerStats, TimerHook};
pub use periodic::{PeriodicTimer, TimerAction};
pub use registration::{ExpiryRegistration, RegistrationId, TimeoutClient};
pub use tree::{EntryHandle, ExpiryTree, ExpiryTreeStats};
