//! tests/common/harness.rs
use async_trait::async_trait;
use expiry_reactor::handler::{ConnectionService, ErrorDelegate, ErrorEvent, HandlerContext, HandlerId};
use expiry_reactor::{Error, Result};
use std::cell::{Cell, RefCell};
use std::sync::Once;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "expiry_reactor=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_test_writer()
            .init();
    });
}

/// Echoes every chunk back to the peer, recording activity on each read.
#[derive(Default)]
pub struct EchoService {
    pub sessions: Cell<u32>,
    pub bytes: Cell<usize>,
}

#[async_trait(?Send)]
impl ConnectionService<TcpStream> for EchoService {
    async fn handle(&self, conn: &mut TcpStream, cx: &HandlerContext<'_>) -> Result<()> {
        self.sessions.set(self.sessions.get() + 1);
        let mut buf = [0u8; 1024];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            cx.touch();
            self.bytes.set(self.bytes.get() + n);
            conn.write_all(&buf[..n]).await?;
        }
    }
}

/// Collects every reported error.
#[derive(Default)]
pub struct CollectingDelegate {
    pub errors: RefCell<Vec<(HandlerId, ErrorEvent, String)>>,
}

impl CollectingDelegate {
    pub fn events(&self) -> Vec<ErrorEvent> {
        self.errors.borrow().iter().map(|(_, event, _)| *event).collect()
    }
}

impl ErrorDelegate for CollectingDelegate {
    fn error(&self, handler: HandlerId, err: &Error, event: ErrorEvent) {
        tracing::info!(%handler, %event, error = %err, "Collected handler error");
        self.errors.borrow_mut().push((handler, event, err.to_string()));
    }
}
