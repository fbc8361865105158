//! 错误与结束委托
//! Error and finalize delegates
//!
//! 处理器不自行记录或处理错误，也不决定自身的去向：错误交给 [`ErrorDelegate`]，
//! 结束后的处理器交给 [`Finalizer`]（例如处理器池用它回收处理器）。
//!
//! A handler neither logs nor handles its errors itself, nor decides where it
//! goes afterwards: errors are routed to an [`ErrorDelegate`] and the finalized
//! handler is handed to a [`Finalizer`] (a pool uses this to recycle it).

use super::core::{ConnectionHandler, HandlerId};
use super::socket::Connection;
use super::suspend::KillSwitch;
use crate::error::Error;
use std::fmt;
use tracing::{debug, warn};

/// 错误发生的阶段
/// Phase in which an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorEvent {
    /// 从监听器接受连接
    /// Accepting from the listener
    Accept,
    /// 运行服务逻辑
    /// Running the service body
    Handle,
    /// 空闲期限到期
    /// The idle deadline expired
    Timeout,
    /// 干净地关闭套接字
    /// Cleanly shutting down the socket
    Shutdown,
    /// 释放套接字
    /// Releasing the socket
    Close,
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorEvent::Accept => "accept",
            ErrorEvent::Handle => "handle",
            ErrorEvent::Timeout => "timeout",
            ErrorEvent::Shutdown => "shutdown",
            ErrorEvent::Close => "close",
        };
        f.write_str(name)
    }
}

/// 处理器错误的接收者
/// Receiver of handler errors
///
/// 实现不得panic，也不得尝试结束处理器。
/// Implementations must not panic nor try to finalize the handler.
pub trait ErrorDelegate {
    fn error(&self, handler: HandlerId, err: &Error, event: ErrorEvent);
}

/// 通过 `tracing` 记录错误的默认委托
/// Default delegate logging errors through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorDelegate;

impl ErrorDelegate for LogErrorDelegate {
    fn error(&self, handler: HandlerId, err: &Error, event: ErrorEvent) {
        match event {
            ErrorEvent::Timeout => debug!(%handler, %event, error = %err, "Connection idle timeout"),
            _ => warn!(%handler, %event, error = %err, "Connection handler error"),
        }
    }
}

/// 接收已结束处理器的回调
/// Callback receiving the finalized handler
///
/// 处理器以 `Idle` 状态、套接字已关闭的形式交出。
/// The handler is handed over `Idle`, with its socket closed.
pub trait Finalizer<C: Connection> {
    fn finalize(&self, handler: ConnectionHandler<C>);

    /// 处理器接受了连接并进入 `Connected`。之后必定会有一次 `finalize`。
    ///
    /// The handler accepted a connection and is now `Connected`. A call to
    /// `finalize` always follows. Owners use this to track in-flight handlers
    /// through `kill`.
    fn connected(&self, _handler: HandlerId, _kill: &KillSwitch) {}
}

impl<C, F> Finalizer<C> for F
where
    C: Connection,
    F: Fn(ConnectionHandler<C>),
{
    fn finalize(&self, handler: ConnectionHandler<C>) {
        self(handler)
    }
}

/// 直接释放处理器的结束器
/// Finalizer that simply drops the handler
#[derive(Debug, Default, Clone, Copy)]
pub struct DropFinalizer;

impl<C: Connection> Finalizer<C> for DropFinalizer {
    fn finalize(&self, handler: ConnectionHandler<C>) {
        debug!(handler = %handler.id(), "Dropping finalized handler");
    }
}
