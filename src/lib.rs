#![deny(clippy::expect_used, clippy::unwrap_used)]

//! The root of the timeout-managed connection handling library.
//! 基于超时管理的连接处理库的根。
//!
//! Everything here runs on a single reactor thread: a tokio current-thread
//! runtime driving a [`tokio::task::LocalSet`]. Shared state uses `Rc` and
//! `RefCell`, so the core types are `!Send`.
//!
//! 所有内容都运行在单个反应器线程上：由tokio单线程运行时驱动的 `LocalSet`。
//! 共享状态使用 `Rc` 与 `RefCell`，因此核心类型都是 `!Send` 的。

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod timer;

pub use error::{Error, Result};
