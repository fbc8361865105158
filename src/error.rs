//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use crate::timer::TimerError;
use thiserror::Error;

/// The primary error type for the connection handling core.
/// 连接处理核心的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error occurred.
    /// 发生了底层的I/O错误。
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Accepting a pending connection from the listener failed.
    /// 从监听器接受挂起连接失败。
    #[error("accept failed: {0}")]
    AcceptFailed(std::io::Error),

    /// The best-effort shutdown of a connected socket failed.
    /// 对已连接套接字的尽力关闭失败。
    #[error("socket shutdown failed: {0}")]
    ShutdownFailed(std::io::Error),

    /// The handler's suspension point was killed. This is the designated
    /// cancellation signal: handler bodies must propagate it, never swallow it.
    ///
    /// 处理器的挂起点被终止。这是指定的取消信号：处理逻辑必须传播它，不得吞掉。
    #[error("handler was killed")]
    Killed,

    /// The connection was idle for longer than its configured deadline.
    /// 连接空闲时间超过了配置的期限。
    #[error("connection idle timeout expired")]
    IdleTimeout,

    /// The application body of a handler failed.
    /// 处理器的应用逻辑失败。
    #[error("handler failed: {0}")]
    Handler(String),

    /// The application body of a handler panicked.
    /// 处理器的应用逻辑发生了panic。
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler has no connection to operate on.
    /// 处理器没有可操作的连接。
    #[error("handler is not connected")]
    NotConnected,

    /// The pool is shutting down and no longer hands out handlers.
    /// 处理器池正在关闭，不再分配处理器。
    #[error("handler pool is shutting down")]
    ShuttingDown,

    /// An error reported by the timer layer.
    /// 定时器层报告的错误。
    #[error("timer error: {0}")]
    Timer(#[from] TimerError),
}

impl Error {
    /// Returns `true` for the designated cancellation signal.
    ///
    /// 对于指定的取消信号返回 `true`。
    pub fn is_killed(&self) -> bool {
        matches!(self, Error::Killed)
    }

    /// Builds an application error from any displayable value.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Error::Handler(msg.to_string())
    }
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(e) => e,
            Error::AcceptFailed(e) => e,
            Error::ShutdownFailed(e) => e,
            Error::Killed => ErrorKind::Interrupted.into(),
            Error::IdleTimeout => ErrorKind::TimedOut.into(),
            Error::Handler(msg) => std::io::Error::other(msg),
            Error::Panicked(msg) => std::io::Error::other(msg),
            Error::NotConnected => ErrorKind::NotConnected.into(),
            Error::ShuttingDown => ErrorKind::ConnectionAborted.into(),
            Error::Timer(e) => std::io::Error::new(ErrorKind::InvalidInput, e),
        }
    }
}
