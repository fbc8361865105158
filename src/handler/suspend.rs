//! 挂起点与终止信号
//! Suspension points and the kill signal
//!
//! 处理器的服务逻辑在一个挂起点中运行：要么作为内联future（"fiber"）由调用方直接
//! 等待，要么通过 `spawn_local` 作为独立的本地任务运行。两种方式都与 [`KillSwitch`]
//! 竞争：终止时服务逻辑的future被丢弃，从而展开其所有状态，然后控制权回到处理器。
//!
//! A handler's service body runs inside a suspension point: either as an
//! inline future ("fiber") awaited directly by the caller, or as a separate
//! local task via `spawn_local`. Both race the body against a [`KillSwitch`]:
//! on kill the body's future is dropped, unwinding all of its state, and
//! control returns to the handler.

use crate::error::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// 挂起策略
/// Suspension strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspensionStrategy {
    /// 在调用方的任务中内联运行
    /// Run inline on the caller's task
    Fiber,
    /// 作为独立的本地任务运行
    /// Run as a separate local task
    #[default]
    Task,
}

/// 终止原因
/// Why a suspension point was killed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// 显式请求（例如池关闭）
    /// Explicit request (e.g. pool shutdown)
    Requested,
    /// 空闲期限到期
    /// The idle deadline expired
    IdleTimeout,
}

#[derive(Default)]
struct KillInner {
    reason: Cell<Option<KillReason>>,
    notify: Notify,
}

/// 可克隆的终止开关
/// Cloneable kill switch
///
/// 一旦触发就保持触发状态；第一次触发的原因获胜。
/// Once tripped it stays tripped; the first reason wins.
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Rc<KillInner>,
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KillSwitch").field(&self.inner.reason.get()).finish()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求终止；如果开关之前尚未触发则返回 `true`
    /// Request a kill; returns `true` if the switch was not tripped before
    pub fn kill(&self) -> bool {
        self.kill_with(KillReason::Requested)
    }

    pub fn kill_with(&self, reason: KillReason) -> bool {
        if self.inner.reason.get().is_some() {
            return false;
        }
        self.inner.reason.set(Some(reason));
        self.inner.notify.notify_waiters();
        trace!(?reason, "Kill switch tripped");
        true
    }

    pub fn is_killed(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<KillReason> {
        self.inner.reason.get()
    }

    /// 等待开关被触发
    /// Wait until the switch is tripped
    pub async fn killed(&self) -> KillReason {
        loop {
            // 先注册等待再检查标志，避免丢失唤醒
            // Register before checking the flag so a wakeup cannot be lost
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.inner.reason.get() {
                return reason;
            }
            notified.await;
        }
    }
}

/// 在挂起点中运行服务逻辑的结果
/// Result of running a service body inside a suspension point
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Killed(KillReason),
    Failed(Error),
    Panicked(String),
}

/// 将 `body` 与终止开关竞争运行，并捕获panic
/// Run `body` raced against the kill switch, catching panics
///
/// 返回 `Err(Error::Killed)` 的服务逻辑被视为已终止，而不是失败。
/// A body returning `Err(Error::Killed)` counts as killed, not failed.
pub async fn run_guarded<F>(body: F, kill: &KillSwitch) -> Outcome
where
    F: Future<Output = Result<()>>,
{
    if let Some(reason) = kill.reason() {
        return Outcome::Killed(reason);
    }

    tokio::select! {
        biased;
        reason = kill.killed() => Outcome::Killed(reason),
        result = AssertUnwindSafe(body).catch_unwind() => match result {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(Error::Killed)) => Outcome::Killed(kill.reason().unwrap_or(KillReason::Requested)),
            Ok(Err(err)) => Outcome::Failed(err),
            Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// 已启动的挂起点
/// A started suspension point
#[must_use = "a fiber only runs when the suspension is joined"]
pub enum Suspension {
    Fiber(Pin<Box<dyn Future<Output = ()>>>),
    Task(JoinHandle<()>),
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspension::Fiber(_) => f.write_str("Suspension::Fiber"),
            Suspension::Task(_) => f.write_str("Suspension::Task"),
        }
    }
}

impl Suspension {
    /// 按照策略启动 `fut`。任务策略必须在 [`tokio::task::LocalSet`] 内调用。
    ///
    /// Start `fut` according to the strategy. The task strategy must be used
    /// from within a [`tokio::task::LocalSet`].
    pub(crate) fn start<F>(strategy: SuspensionStrategy, fut: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        match strategy {
            SuspensionStrategy::Fiber => Suspension::Fiber(Box::pin(fut)),
            SuspensionStrategy::Task => Suspension::Task(tokio::task::spawn_local(fut)),
        }
    }

    pub fn strategy(&self) -> SuspensionStrategy {
        match self {
            Suspension::Fiber(_) => SuspensionStrategy::Fiber,
            Suspension::Task(_) => SuspensionStrategy::Task,
        }
    }

    /// 等待挂起点完成。内联fiber在此处才真正运行。
    /// Wait for the suspension point to finish. An inline fiber actually runs here.
    pub async fn join(self) {
        match self {
            Suspension::Fiber(fut) => fut.await,
            Suspension::Task(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Handler task did not complete");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::LocalSet;

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[tokio::test]
    async fn test_completed_and_failed_outcomes() {
        let kill = KillSwitch::new();
        assert!(matches!(run_guarded(async { Ok(()) }, &kill).await, Outcome::Completed));

        let outcome = run_guarded(async { Err(Error::handler("bad request")) }, &kill).await;
        match outcome {
            Outcome::Failed(Error::Handler(msg)) => assert_eq!(msg, "bad request"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_killed_signal_from_body_is_not_a_failure() {
        let kill = KillSwitch::new();
        let outcome = run_guarded(async { Err(Error::Killed) }, &kill).await;
        assert!(matches!(outcome, Outcome::Killed(KillReason::Requested)));
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let kill = KillSwitch::new();
        let outcome = run_guarded(explode(), &kill).await;
        match outcome {
            Outcome::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kill_before_start_never_polls_body() {
        let kill = KillSwitch::new();
        assert!(kill.kill_with(KillReason::IdleTimeout));
        assert!(!kill.kill());

        let polled = Rc::new(Cell::new(false));
        let polled_body = polled.clone();
        let outcome = run_guarded(
            async move {
                polled_body.set(true);
                Ok(())
            },
            &kill,
        )
        .await;
        assert!(matches!(outcome, Outcome::Killed(KillReason::IdleTimeout)));
        assert!(!polled.get());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_unwinds_pending_body() {
        LocalSet::new()
            .run_until(async {
                let kill = KillSwitch::new();
                let dropped = Rc::new(Cell::new(false));
                let flag = DropFlag(dropped.clone());

                let remote = kill.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    remote.kill();
                });

                let outcome = run_guarded(
                    async move {
                        let _flag = flag;
                        std::future::pending::<()>().await;
                        Ok(())
                    },
                    &kill,
                )
                .await;

                assert!(matches!(outcome, Outcome::Killed(KillReason::Requested)));
                assert!(dropped.get());
            })
            .await;
    }

    #[tokio::test]
    async fn test_killed_resolves_after_kill() {
        let kill = KillSwitch::new();
        kill.kill();
        assert_eq!(kill.killed().await, KillReason::Requested);
        assert!(kill.clone().is_killed());
    }

    #[tokio::test]
    async fn test_suspension_strategies_run_to_completion() {
        LocalSet::new()
            .run_until(async {
                for strategy in [SuspensionStrategy::Fiber, SuspensionStrategy::Task] {
                    let ran = Rc::new(Cell::new(false));
                    let ran_fut = ran.clone();
                    let suspension = Suspension::start(strategy, async move {
                        tokio::task::yield_now().await;
                        ran_fut.set(true);
                    });
                    assert_eq!(suspension.strategy(), strategy);
                    suspension.join().await;
                    assert!(ran.get());
                }
            })
            .await;
    }

    #[tokio::test]
    async fn test_fiber_does_not_run_until_joined() {
        let ran = Rc::new(Cell::new(false));
        let ran_fut = ran.clone();
        let suspension = Suspension::start(SuspensionStrategy::Fiber, async move {
            ran_fut.set(true);
        });
        tokio::task::yield_now().await;
        assert!(!ran.get());
        suspension.join().await;
        assert!(ran.get());
    }
}
