//! 处理器池与接受循环
//! Handler pool and accept loop
//!
//! 池中的处理器通过结束器回收：每个结束的处理器回到空闲列表并唤醒等待者。
//! 关闭时池停止分配处理器，终止所有正在运行的处理器，并等待它们全部结束。
//!
//! Handlers are recycled through their finalizer: every finalized handler goes
//! back to the idle list and wakes waiters. On shutdown the pool stops handing
//! out handlers, kills every in-flight handler and waits until all of them
//! have finalized.

use super::core::{ConnectionHandler, ConnectionService, HandlerId};
use super::delegate::{ErrorDelegate, Finalizer};
use super::socket::{Connection, Listener};
use super::suspend::KillSwitch;
use crate::config::{Config, HandlerConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::timer::TimeoutManager;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

struct PoolInner<C: Connection> {
    handler_config: HandlerConfig,
    pool_config: PoolConfig,
    service: Rc<dyn ConnectionService<C>>,
    error_delegate: Rc<dyn ErrorDelegate>,
    manager: Option<TimeoutManager>,
    finalizer: Rc<dyn Finalizer<C>>,
    idle: RefCell<Vec<ConnectionHandler<C>>>,
    /// 正在处理连接的处理器及其终止开关
    /// Handlers serving a connection, with their kill switches
    active: RefCell<HashMap<HandlerId, KillSwitch>>,
    /// 已分配但尚未归还的处理器数
    /// Handlers handed out and not yet returned
    outstanding: Cell<usize>,
    next_id: Cell<u64>,
    completed: Cell<u64>,
    shutting_down: Cell<bool>,
    released: Notify,
    shutdown: Notify,
}

impl<C: Connection> PoolInner<C> {
    fn create_handler(&self) -> ConnectionHandler<C> {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let handler = ConnectionHandler::new(id, self.service.clone())
            .with_finalizer(self.finalizer.clone())
            .with_error_delegate(self.error_delegate.clone())
            .with_config(self.handler_config.clone());
        match &self.manager {
            Some(manager) => handler.with_timeout_manager(manager.clone()),
            None => handler,
        }
    }

    /// 归还处理器；关闭期间直接释放
    /// Return a handler; dropped while shutting down
    fn release(&self, handler: ConnectionHandler<C>) {
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
        if !self.shutting_down.get() {
            self.idle.borrow_mut().push(handler);
        }
        self.released.notify_waiters();
    }
}

struct PoolFinalizer<C: Connection> {
    pool: Weak<PoolInner<C>>,
}

impl<C: Connection> Finalizer<C> for PoolFinalizer<C> {
    fn finalize(&self, handler: ConnectionHandler<C>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        pool.active.borrow_mut().remove(&handler.id());
        pool.completed.set(pool.completed.get() + 1);
        debug!(handler = %handler.id(), "Handler returned to pool");
        pool.release(handler);
    }

    fn connected(&self, handler: HandlerId, kill: &KillSwitch) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if pool.shutting_down.get() {
            debug!(%handler, "Connected during shutdown, killing");
            kill.kill();
        }
        pool.active.borrow_mut().insert(handler, kill.clone());
    }
}

/// 连接处理器池
/// Connection handler pool
///
/// 可廉价克隆；所有克隆共享同一个池。
/// Cheap to clone; all clones share one pool.
pub struct HandlerPool<C: Connection> {
    inner: Rc<PoolInner<C>>,
}

impl<C: Connection> Clone for HandlerPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for HandlerPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPool")
            .field("active", &self.active())
            .field("idle", &self.idle())
            .field("outstanding", &self.outstanding())
            .field("completed", &self.completed())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl<C: Connection> HandlerPool<C> {
    /// 创建处理器池。没有超时管理器时空闲超时被禁用。
    /// Create a handler pool. Idle timeouts are disabled without a timeout manager.
    pub fn new(
        config: &Config,
        service: Rc<dyn ConnectionService<C>>,
        error_delegate: Rc<dyn ErrorDelegate>,
        manager: Option<TimeoutManager>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<PoolInner<C>>| PoolInner {
            handler_config: config.handler.clone(),
            pool_config: config.pool.clone(),
            service,
            error_delegate,
            manager,
            finalizer: Rc::new(PoolFinalizer { pool: weak.clone() }),
            idle: RefCell::new(Vec::new()),
            active: RefCell::new(HashMap::new()),
            outstanding: Cell::new(0),
            next_id: Cell::new(1),
            completed: Cell::new(0),
            shutting_down: Cell::new(false),
            released: Notify::new(),
            shutdown: Notify::new(),
        });

        let prewarm = inner.pool_config.prewarm.min(inner.pool_config.max_handlers);
        {
            let mut idle = inner.idle.borrow_mut();
            for _ in 0..prewarm {
                idle.push(inner.create_handler());
            }
        }
        debug!(prewarm, max = inner.pool_config.max_handlers, "Handler pool created");

        Self { inner }
    }

    /// 获取一个回收的空闲处理器，或在上限内新建一个；耗尽或关闭时返回 `None`
    /// Take a recycled idle handler, or create one within the limit; `None`
    /// when exhausted or shutting down
    pub fn acquire(&self) -> Option<ConnectionHandler<C>> {
        let inner = &self.inner;
        if inner.shutting_down.get() {
            return None;
        }

        let recycled = inner.idle.borrow_mut().pop();
        let handler = match recycled {
            Some(handler) => handler,
            None if inner.outstanding.get() < inner.pool_config.max_handlers => inner.create_handler(),
            None => return None,
        };
        inner.outstanding.set(inner.outstanding.get() + 1);
        Some(handler)
    }

    /// 等待直到有处理器可用
    /// Wait until a handler is available
    pub async fn acquire_wait(&self) -> Result<ConnectionHandler<C>> {
        loop {
            let notified = self.inner.released.notified();
            if self.inner.shutting_down.get() {
                return Err(Error::ShuttingDown);
            }
            if let Some(handler) = self.acquire() {
                return Ok(handler);
            }
            notified.await;
        }
    }

    /// 归还一个未使用的处理器
    /// Give back a handler that was never used
    ///
    /// # Panics
    ///
    /// 处理器不处于 `Idle` 状态时。
    /// If the handler is not `Idle`.
    pub fn release(&self, handler: ConnectionHandler<C>) {
        assert!(
            handler.state().is_idle(),
            "{} released while {}",
            handler.id(),
            handler.state()
        );
        self.inner.release(handler);
    }

    /// 接受循环：获取处理器、接受连接并在本地任务中处理，直到池关闭。
    /// 必须在 [`tokio::task::LocalSet`] 内运行。
    ///
    /// Accept loop: acquire a handler, accept a connection and handle it on a
    /// local task, until the pool shuts down. Must run within a
    /// [`tokio::task::LocalSet`].
    ///
    /// 接受失败后等待 [`PoolConfig::accept_backoff`] 再重试。
    /// After an accept failure the loop waits [`PoolConfig::accept_backoff`]
    /// before retrying.
    pub async fn run_acceptor<L>(&self, listener: &L) -> Result<()>
    where
        L: Listener<Conn = C> + ?Sized,
    {
        info!(listener = %listener.local_description(), "Acceptor started");
        loop {
            let mut handler = match self.acquire_wait().await {
                Ok(handler) => handler,
                Err(Error::ShuttingDown) => break,
                Err(e) => return Err(e),
            };

            let accepted = tokio::select! {
                biased;
                _ = self.wait_shutdown() => None,
                result = handler.assign(listener) => Some(result),
            };
            let Some(accepted) = accepted else {
                self.inner.release(handler);
                break;
            };

            if let Err(e) = &accepted {
                warn!(handler = %handler.id(), error = %e, "Accept failed, finalizing handler");
            }

            let suspension = handler.handle_connection();
            tokio::task::spawn_local(suspension.join());

            if accepted.is_err() {
                let backoff = self.inner.pool_config.accept_backoff;
                if backoff.is_zero() {
                    tokio::task::yield_now().await;
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = self.wait_shutdown() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        info!(completed = self.completed(), "Acceptor stopped");
        Ok(())
    }

    async fn wait_shutdown(&self) {
        loop {
            let notified = self.inner.shutdown.notified();
            if self.inner.shutting_down.get() {
                return;
            }
            notified.await;
        }
    }

    /// 停止接受，终止所有正在运行的处理器，并等待它们全部结束
    /// Stop accepting, kill every in-flight handler and wait until all have finalized
    ///
    /// 通过 [`acquire`](Self::acquire) 取出的处理器同样会在连接后被终止；
    /// 从未被分配连接的处理器必须由持有者归还。
    ///
    /// Handlers taken with [`acquire`](Self::acquire) are killed too once
    /// connected; a handler that never gets a connection must be given back
    /// by whoever holds it.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutting_down.replace(true) {
            info!(active = self.active(), "Shutting down handler pool");
        }
        inner.shutdown.notify_waiters();
        inner.released.notify_waiters();

        let switches: Vec<KillSwitch> = inner.active.borrow().values().cloned().collect();
        for switch in switches {
            switch.kill();
        }

        loop {
            let notified = inner.released.notified();
            if inner.outstanding.get() == 0 {
                break;
            }
            notified.await;
        }
        inner.idle.borrow_mut().clear();
        info!(completed = self.completed(), "Handler pool shut down");
    }

    /// 正在处理连接的处理器数
    /// Handlers currently serving a connection
    pub fn active(&self) -> usize {
        self.inner.active.borrow().len()
    }

    pub fn idle(&self) -> usize {
        self.inner.idle.borrow().len()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.get()
    }

    /// 已完成的生命周期数
    /// Lifecycles completed
    pub fn completed(&self) -> u64 {
        self.inner.completed.get()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.get()
    }
}
