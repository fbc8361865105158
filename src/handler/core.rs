//! 连接处理器核心
//! Connection handler core
//!
//! [`ConnectionHandler`] 把一个套接字、一个挂起点以及结束/错误协议绑定在一起。
//! 无论服务逻辑正常完成、失败、panic还是被终止，也无论接受是否成功，
//! 每个生命周期都恰好到达一次结束步骤。
//!
//! [`ConnectionHandler`] binds a socket, a suspension point and the
//! finalize/error protocol together. Whether the service body completes,
//! fails, panics or is killed, and whether the accept succeeded at all, every
//! lifecycle reaches the finalize step exactly once.

use super::delegate::{DropFinalizer, ErrorDelegate, ErrorEvent, Finalizer, LogErrorDelegate};
use super::idle::IdleTimeout;
use super::socket::{Connection, Listener, OwnedSocket};
use super::state::HandlerState;
use super::suspend::{KillReason, KillSwitch, Outcome, Suspension, SuspensionStrategy, run_guarded};
use crate::config::HandlerConfig;
use crate::error::{Error, Result};
use crate::timer::TimeoutManager;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use tracing::{Instrument, debug, debug_span};

/// 处理器标识
/// Handler identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

impl HandlerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// 应用层的连接服务逻辑
/// Application-level connection service body
///
/// 返回 `Err(Error::Killed)` 表示服务逻辑观察到了终止信号；它必须被传播而不是吞掉。
/// Returning `Err(Error::Killed)` means the body observed the kill signal; it
/// must be propagated, never swallowed.
#[async_trait(?Send)]
pub trait ConnectionService<C: Connection> {
    async fn handle(&self, conn: &mut C, cx: &HandlerContext<'_>) -> Result<()>;
}

/// 服务逻辑可见的处理器上下文
/// Handler context visible to the service body
pub struct HandlerContext<'a> {
    id: HandlerId,
    kill: &'a KillSwitch,
    idle: Option<&'a IdleTimeout>,
    manager: Option<&'a TimeoutManager>,
}

impl<'a> HandlerContext<'a> {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// 记录一次活动，推迟空闲期限
    /// Record activity, pushing the idle deadline back
    pub fn touch(&self) -> bool {
        self.idle.is_some_and(IdleTimeout::touch)
    }

    pub fn kill_switch(&self) -> &'a KillSwitch {
        self.kill
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    /// 供服务逻辑注册自身超时的管理器
    /// Manager the body can register its own timeouts with
    pub fn timeout_manager(&self) -> Option<&'a TimeoutManager> {
        self.manager
    }
}

/// 处理器统计信息
/// Handler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// 成功接受的连接数
    /// Connections accepted
    pub connections: u64,
    /// 报告给委托的错误数
    /// Errors reported to the delegate
    pub errors: u64,
    /// 完成的结束步骤数
    /// Finalize steps completed
    pub finalizations: u64,
    /// 被终止的挂起点数
    /// Suspension points killed
    pub kills: u64,
}

/// 连接处理器
/// Connection handler
///
/// 状态机：`Idle → Connected → Handling → Finalizing → Idle`。
/// 处理器可以在多个生命周期中复用：结束后以 `Idle` 状态交给 [`Finalizer`]。
///
/// A handler is reusable across lifecycles: once finalized it is handed to its
/// [`Finalizer`] in the `Idle` state.
pub struct ConnectionHandler<C: Connection> {
    id: HandlerId,
    state: HandlerState,
    socket: OwnedSocket<C>,
    service: Rc<dyn ConnectionService<C>>,
    finalizer: Rc<dyn Finalizer<C>>,
    error_delegate: Rc<dyn ErrorDelegate>,
    manager: Option<TimeoutManager>,
    config: HandlerConfig,
    kill: KillSwitch,
    stats: HandlerStats,
}

impl<C: Connection> fmt::Debug for ConnectionHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("socket", &self.socket)
            .field("strategy", &self.config.strategy)
            .field("kill", &self.kill)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<C: Connection> ConnectionHandler<C> {
    /// 使用默认委托创建处理器：错误写入日志，结束后释放
    /// Create a handler with default delegates: errors are logged, the handler
    /// is dropped once finalized
    pub fn new(id: HandlerId, service: Rc<dyn ConnectionService<C>>) -> Self {
        Self {
            id,
            state: HandlerState::Idle,
            socket: OwnedSocket::default(),
            service,
            finalizer: Rc::new(DropFinalizer),
            error_delegate: Rc::new(LogErrorDelegate),
            manager: None,
            config: HandlerConfig::default(),
            kill: KillSwitch::new(),
            stats: HandlerStats::default(),
        }
    }

    pub fn with_finalizer(mut self, finalizer: Rc<dyn Finalizer<C>>) -> Self {
        self.finalizer = finalizer;
        self
    }

    pub fn with_error_delegate(mut self, delegate: Rc<dyn ErrorDelegate>) -> Self {
        self.error_delegate = delegate;
        self
    }

    /// 设置超时管理器；空闲超时需要它
    /// Set the timeout manager; required for idle timeouts
    pub fn with_timeout_manager(mut self, manager: TimeoutManager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    pub fn strategy(&self) -> SuspensionStrategy {
        self.config.strategy
    }

    /// 当前生命周期的终止开关
    /// Kill switch of the current lifecycle
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    pub fn is_socket_open(&self) -> bool {
        self.socket.is_open()
    }

    pub fn peer(&self) -> Option<String> {
        self.socket.peer()
    }

    /// 把错误交给错误委托。从不panic，也从不结束处理器。
    /// Route an error to the error delegate. Never panics, never finalizes.
    pub fn error(&mut self, err: &Error, event: ErrorEvent) {
        self.stats.errors += 1;
        self.error_delegate.error(self.id, err, event);
    }

    /// 从监听器接受一个连接
    /// Accept a connection from the listener
    ///
    /// 失败时错误以 [`ErrorEvent::Accept`] 报告，处理器保持 `Idle`；
    /// 随后的 [`handle_connection`](Self::handle_connection) 会直接进入结束步骤。
    ///
    /// On failure the error is reported with [`ErrorEvent::Accept`] and the
    /// handler stays `Idle`; the following
    /// [`handle_connection`](Self::handle_connection) goes straight to finalize.
    ///
    /// # Panics
    ///
    /// 处理器不处于 `Idle` 状态时。
    /// If the handler is not `Idle`.
    pub async fn assign<L>(&mut self, listener: &L) -> Result<()>
    where
        L: Listener<Conn = C> + ?Sized,
    {
        assert!(
            self.state.is_idle(),
            "{} assigned while {}",
            self.id,
            self.state
        );

        match listener.accept().await {
            Ok(conn) => {
                debug!(handler = %self.id, peer = %conn.peer(), "Connection accepted");
                self.socket.attach(conn);
                self.state.advance(HandlerState::Connected);
                self.stats.connections += 1;
                self.finalizer.connected(self.id, &self.kill);
                Ok(())
            }
            Err(e) => {
                let err = Error::AcceptFailed(e);
                self.error(&err, ErrorEvent::Accept);
                Err(err)
            }
        }
    }

    /// 在配置的挂起策略下运行服务逻辑，随后结束连接。
    ///
    /// 任务策略立即通过 `spawn_local` 启动；fiber策略在返回的
    /// [`Suspension`] 被等待时内联运行。如果挂起点在结束之前被丢弃，
    /// 套接字会被同步关闭（跳过优雅关闭），处理器照常交给结束器。
    ///
    /// Run the service body under the configured suspension strategy, then
    /// finalize. The task strategy starts immediately via `spawn_local`; the
    /// fiber strategy runs inline when the returned [`Suspension`] is awaited.
    /// If the suspension point is dropped before finalizing, the socket is
    /// closed synchronously (skipping graceful shutdown) and the handler is
    /// still handed to its finalizer.
    #[must_use = "a fiber only runs when the suspension is joined"]
    pub fn handle_connection(self) -> Suspension {
        let span = debug_span!("connection", handler = %self.id);
        let strategy = self.config.strategy;
        Suspension::start(strategy, Self::run(FinalizeGuard::new(self)).instrument(span))
    }

    /// 接受一个连接并处理它直到结束；返回接受的结果
    /// Accept one connection and handle it until finalized; returns the accept result
    ///
    /// 返回的future即使在完成前被丢弃（包括从未被轮询），处理器也会被结束。
    /// The handler is finalized even if the returned future is dropped early,
    /// including before it is first polled.
    pub fn serve<'a, L>(self, listener: &'a L) -> impl Future<Output = Result<()>> + 'a
    where
        L: Listener<Conn = C> + ?Sized,
    {
        Self::serve_guarded(FinalizeGuard::new(self), listener)
    }

    async fn serve_guarded<L>(mut guard: FinalizeGuard<C>, listener: &L) -> Result<()>
    where
        L: Listener<Conn = C> + ?Sized,
    {
        let accepted = match guard.handler.as_mut() {
            Some(handler) => handler.assign(listener).await,
            None => Err(Error::NotConnected),
        };
        if let Some(handler) = guard.disarm() {
            handler.handle_connection().join().await;
        }
        accepted
    }

    async fn run(mut guard: FinalizeGuard<C>) {
        if let Some(handler) = guard.handler.as_mut() {
            handler.handle_session().await;
            handler.begin_finalize().await;
        }
        if let Some(handler) = guard.disarm() {
            handler.complete_finalize();
        }
    }

    async fn handle_session(&mut self) {
        if self.state != HandlerState::Connected {
            return;
        }
        self.state.advance(HandlerState::Handling);
        let idle = self.start_idle_timeout();

        let outcome = {
            let cx = HandlerContext {
                id: self.id,
                kill: &self.kill,
                idle: idle.as_ref(),
                manager: self.manager.as_ref(),
            };
            match self.socket.get_mut() {
                Some(conn) => run_guarded(self.service.handle(conn, &cx), &self.kill).await,
                None => Outcome::Failed(Error::NotConnected),
            }
        };

        if let Some(idle) = &idle {
            idle.disarm();
        }
        self.report(outcome);
    }

    fn start_idle_timeout(&self) -> Option<IdleTimeout> {
        let manager = self.manager.as_ref()?;
        let timeout = self.config.idle_timeout?;
        let idle = IdleTimeout::new(manager, timeout, self.kill.clone(), self.id);
        idle.arm().then_some(idle)
    }

    fn report(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => {
                debug!(handler = %self.id, "Connection handled");
            }
            Outcome::Killed(KillReason::Requested) => {
                self.stats.kills += 1;
                debug!(handler = %self.id, "Handler killed");
            }
            Outcome::Killed(KillReason::IdleTimeout) => {
                self.stats.kills += 1;
                self.error(&Error::IdleTimeout, ErrorEvent::Timeout);
            }
            Outcome::Failed(err) => self.error(&err, ErrorEvent::Handle),
            Outcome::Panicked(msg) => self.error(&Error::Panicked(msg), ErrorEvent::Handle),
        }
    }

    /// 结束步骤的异步部分：进入 `Finalizing` 并尝试优雅关闭
    /// Async part of finalize: enter `Finalizing` and attempt a graceful shutdown
    async fn begin_finalize(&mut self) {
        self.state.advance(HandlerState::Finalizing);

        if self.config.graceful_shutdown {
            if let Some(Err(e)) = self.socket.shutdown().await {
                self.error(&Error::ShutdownFailed(e), ErrorEvent::Shutdown);
            }
        }
    }

    /// 结束步骤的同步部分：关闭套接字，重置状态并把处理器交给结束器
    /// Sync part of finalize: close the socket, reset state and hand the handler to the finalizer
    fn complete_finalize(mut self) {
        if self.state != HandlerState::Finalizing {
            self.state.advance(HandlerState::Finalizing);
        }
        if let Some(Err(e)) = self.socket.close() {
            self.error(&Error::Io(e), ErrorEvent::Close);
        }

        self.state.advance(HandlerState::Idle);
        self.kill = KillSwitch::new();
        self.stats.finalizations += 1;
        debug!(handler = %self.id, stats = ?self.stats, "Handler finalized");

        let finalizer = self.finalizer.clone();
        finalizer.finalize(self);
    }
}

/// 保证处理器在其future被丢弃时仍然到达结束步骤
/// Makes sure a handler still reaches finalize when its future is dropped
struct FinalizeGuard<C: Connection> {
    handler: Option<ConnectionHandler<C>>,
}

impl<C: Connection> FinalizeGuard<C> {
    fn new(handler: ConnectionHandler<C>) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    fn disarm(&mut self) -> Option<ConnectionHandler<C>> {
        self.handler.take()
    }
}

impl<C: Connection> Drop for FinalizeGuard<C> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            debug!(
                handler = %handler.id,
                state = %handler.state,
                "Handler dropped before finalize, closing synchronously"
            );
            handler.complete_finalize();
        }
    }
}
