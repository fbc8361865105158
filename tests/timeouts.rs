//! 超时管理器公共接口集成测试
//! Timeout manager public API integration tests

mod common;

use common::harness::init_tracing;
use expiry_reactor::clock::{ManualClock, SystemClock};
use expiry_reactor::config::TimerConfig;
use expiry_reactor::timer::{
    ExpiryRegistration, NO_EXPIRATION, PeriodicTimer, TimeoutClient, TimeoutManager, TimerAction,
    spawn_timer_driver,
};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::LocalSet;

/// A client that records its name on timeout and may re-register once.
struct Named {
    name: &'static str,
    log: Rc<RefCell<Vec<&'static str>>>,
    again_after_us: Cell<Option<u64>>,
    registration: ExpiryRegistration,
}

impl TimeoutClient for Named {
    fn timeout(&self) {
        self.log.borrow_mut().push(self.name);
        if let Some(us) = self.again_after_us.take() {
            self.registration.register(us);
        }
    }
}

fn named(manager: &TimeoutManager, name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Rc<Named> {
    Rc::new_cyclic(|weak: &Weak<Named>| {
        let client: Weak<dyn TimeoutClient> = weak.clone();
        Named {
            name,
            log: log.clone(),
            again_after_us: Cell::new(None),
            registration: ExpiryRegistration::new(manager, client),
        }
    })
}

#[test]
fn test_expired_clients_fire_in_deadline_order() {
    init_tracing();
    let manager = TimeoutManager::new(ManualClock::new(0));
    let log = Rc::new(RefCell::new(Vec::new()));
    let a = named(&manager, "A", &log);
    let b = named(&manager, "B", &log);
    let c = named(&manager, "C", &log);

    assert!(a.registration.register(100));
    assert!(b.registration.register(50));
    assert!(c.registration.register(150));

    assert_eq!(manager.check_timeouts(120), 2);
    assert_eq!(*log.borrow(), vec!["B", "A"]);
    assert_eq!(manager.next_expiration_us(), 150);
}

#[test]
fn test_zero_timeout_registers_nothing() {
    init_tracing();
    let manager = TimeoutManager::new(ManualClock::new(0));
    let log = Rc::new(RefCell::new(Vec::new()));
    let d = named(&manager, "D", &log);

    assert!(!d.registration.register(0));
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.next_expiration_us(), NO_EXPIRATION);
}

#[test]
fn test_self_reregistration_fires_again_exactly_once() {
    init_tracing();
    let clock = ManualClock::new(0);
    let manager = TimeoutManager::new(clock.clone());
    let log = Rc::new(RefCell::new(Vec::new()));
    let e = named(&manager, "E", &log);
    e.again_after_us.set(Some(40));
    e.registration.register(10);

    clock.set(10);
    assert_eq!(manager.check_timeouts_now(), 1);
    assert_eq!(manager.pending_count(), 1);

    clock.set(1_000);
    assert_eq!(manager.check_timeouts_now(), 1);
    assert_eq!(manager.check_timeouts_now(), 0);
    assert_eq!(*log.borrow(), vec!["E", "E"]);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_timer_driven_by_reactor() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let manager = TimeoutManager::new(SystemClock::new());
            let driver = spawn_timer_driver(&manager, &TimerConfig::default());

            let fired = Rc::new(Cell::new(0u64));
            let fired_cb = fired.clone();
            let timer = PeriodicTimer::start_every(&manager, Duration::from_millis(20), move |tick| {
                fired_cb.set(tick);
                if tick == 4 { TimerAction::Stop } else { TimerAction::Continue }
            })
            .unwrap();

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(fired.get(), 4);
            assert!(!timer.is_running());
            assert_eq!(manager.pending_count(), 0);
            assert_eq!(driver.armed_deadline(), None);

            driver.shutdown().await;
        })
        .await;
}
