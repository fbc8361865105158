//! 基于真实TCP连接的处理器池集成测试
//! Handler pool integration tests over real TCP connections

mod common;

use common::harness::{CollectingDelegate, EchoService, init_tracing};
use expiry_reactor::config::{Config, HandlerConfig, PoolConfig, TimerConfig};
use expiry_reactor::handler::{ErrorEvent, HandlerPool, SuspensionStrategy};
use expiry_reactor::timer::{TimeoutManager, spawn_timer_driver};
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;
use tokio::time::{sleep, timeout};

fn config(idle_timeout: Option<Duration>) -> Config {
    Config {
        handler: HandlerConfig {
            strategy: SuspensionStrategy::Task,
            idle_timeout,
            graceful_shutdown: true,
        },
        pool: PoolConfig {
            max_handlers: 4,
            prewarm: 2,
            accept_backoff: Duration::from_millis(10),
        },
        timer: TimerConfig::default(),
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_echo_connection_lifecycle() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let manager = TimeoutManager::new_default();
            let driver = spawn_timer_driver(&manager, &TimerConfig::default());
            let service = Rc::new(EchoService::default());
            let delegate = Rc::new(CollectingDelegate::default());
            let pool: HandlerPool<TcpStream> = HandlerPool::new(
                &config(Some(Duration::from_secs(5))),
                service.clone(),
                delegate.clone(),
                Some(manager.clone()),
            );

            let listener = Rc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
            let addr = listener.local_addr().unwrap();
            let acceptor = {
                let pool = pool.clone();
                let listener = listener.clone();
                tokio::task::spawn_local(async move { pool.run_acceptor(&*listener).await })
            };

            for round in 0..3u8 {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let msg = [b'p', b'i', b'n', b'g', b'0' + round];
                client.write_all(&msg).await.unwrap();
                let mut echoed = [0u8; 5];
                client.read_exact(&mut echoed).await.unwrap();
                assert_eq!(echoed, msg);
                client.shutdown().await.unwrap();

                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());
            }

            eventually(|| pool.completed() == 3).await;
            assert_eq!(service.sessions.get(), 3);
            assert_eq!(service.bytes.get(), 15);
            assert!(delegate.events().is_empty());
            assert_eq!(manager.pending_count(), 0);

            pool.shutdown().await;
            acceptor.await.unwrap().unwrap();
            driver.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_idle_connection_is_disconnected() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let manager = TimeoutManager::new_default();
            let driver = spawn_timer_driver(&manager, &TimerConfig::default());
            let delegate = Rc::new(CollectingDelegate::default());
            let pool: HandlerPool<TcpStream> = HandlerPool::new(
                &config(Some(Duration::from_millis(100))),
                Rc::new(EchoService::default()),
                delegate.clone(),
                Some(manager.clone()),
            );

            let listener = Rc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
            let addr = listener.local_addr().unwrap();
            let acceptor = {
                let pool = pool.clone();
                let listener = listener.clone();
                tokio::task::spawn_local(async move { pool.run_acceptor(&*listener).await })
            };

            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 16];
            let read = timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("server should close the idle connection");
            assert_eq!(read.unwrap_or(0), 0);

            eventually(|| pool.completed() == 1).await;
            assert_eq!(delegate.events(), vec![ErrorEvent::Timeout]);
            assert_eq!(manager.pending_count(), 0);

            pool.shutdown().await;
            acceptor.await.unwrap().unwrap();
            driver.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_shutdown_disconnects_active_clients() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let delegate = Rc::new(CollectingDelegate::default());
            let pool: HandlerPool<TcpStream> = HandlerPool::new(
                &config(None),
                Rc::new(EchoService::default()),
                delegate.clone(),
                None,
            );

            let listener = Rc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
            let addr = listener.local_addr().unwrap();
            let acceptor = {
                let pool = pool.clone();
                let listener = listener.clone();
                tokio::task::spawn_local(async move { pool.run_acceptor(&*listener).await })
            };

            let mut first = TcpStream::connect(addr).await.unwrap();
            let mut second = TcpStream::connect(addr).await.unwrap();
            eventually(|| pool.active() == 2).await;

            pool.shutdown().await;
            acceptor.await.unwrap().unwrap();
            assert_eq!(pool.completed(), 2);
            assert!(delegate.events().is_empty());

            let mut buf = [0u8; 8];
            for client in [&mut first, &mut second] {
                let read = timeout(Duration::from_secs(2), client.read(&mut buf))
                    .await
                    .expect("server should have closed the connection");
                assert_eq!(read.unwrap_or(0), 0);
            }
        })
        .await;
}
