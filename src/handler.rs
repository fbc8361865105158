//! 连接处理模块
//! Connection Handling Module
//!
//! 该模块实现了事件驱动的连接处理核心：一个把套接字、挂起点以及结束/错误协议
//! 绑定在一起的状态机，基于超时管理器的空闲断开，以及可回收处理器的池与接受循环。
//!
//! This module implements the event-driven connection handling core: a state
//! machine binding a socket, a suspension point and the finalize/error
//! protocol together, idle disconnection on top of the timeout manager, and a
//! pool of recyclable handlers with an accept loop.

pub mod core;
pub mod delegate;
pub mod idle;
pub mod pool;
pub mod socket;
pub mod state;
pub mod suspend;


pub use self::core::{ConnectionHandler, ConnectionService, HandlerContext, HandlerId, HandlerStats};
pub use delegate::{DropFinalizer, ErrorDelegate, ErrorEvent, Finalizer, LogErrorDelegate};
pub use idle::IdleTimeout;
pub use pool::HandlerPool;
pub use socket::{Connection, Listener, OwnedSocket, RawHandle};
pub use state::HandlerState;
pub use suspend::{KillReason, KillSwitch, Outcome, Suspension, SuspensionStrategy, run_guarded};
