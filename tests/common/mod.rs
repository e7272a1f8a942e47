//! A minimal in-memory `Session`/`SessionFactory` pair for exercising the
//! pool engine's public API without a real backend, in the shape of the
//! teacher's `tests/any/pool.rs` `AtomicUsize`-counted stub factory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_core::future::BoxFuture;

use connpool::config::PoolConfig;
use connpool::session::{Credentials, Session, SessionFactory};
use connpool::Result;

/// A fake transport: tracks whether it has been closed and whether the next
/// liveness check should report unhealthy.
pub struct MockSession {
    pub id: usize,
    closed: bool,
    healthy: Arc<AtomicBool>,
}

impl Session for MockSession {
    fn is_valid(&mut self, _timeout: Duration) -> BoxFuture<'_, bool> {
        let healthy = self.healthy.load(Ordering::SeqCst);
        Box::pin(async move { healthy })
    }

    fn execute(&mut self, _sql: &str, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
        let healthy = self.healthy.load(Ordering::SeqCst);
        Box::pin(async move {
            if healthy {
                Ok(())
            } else {
                Err(connpool::Error::session_invalid(std::io::Error::other("probe failed")))
            }
        })
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        self.closed = true;
        Box::pin(async move {})
    }
}

/// Opens [`MockSession`]s, counting how many were created and closed, and
/// can be flipped to fail every subsequent `open` to simulate a backend
/// outage.
#[derive(Clone)]
pub struct MockFactory {
    next_id: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self {
            next_id: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MockFactory {
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl SessionFactory for MockFactory {
    type Session = MockSession;

    fn open<'a>(&'a self, _credentials: &'a Credentials) -> BoxFuture<'a, Result<Self::Session>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(connpool::Error::backend_down(std::io::Error::other("connection refused")));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockSession {
                id,
                closed: false,
                healthy: Arc::clone(&self.healthy),
            })
        })
    }
}

/// A `PoolConfig` with every required field filled in and the ambient
/// maintenance timers disabled by default so scenario tests control timing
/// explicitly; individual fields are overridden per scenario.
pub fn base_config(pool_name: &str) -> PoolConfig {
    PoolConfig {
        pool_name: pool_name.to_string(),
        url: "mock://localhost".to_string(),
        username: "user".to_string(),
        password: "pass".to_string(),
        custom_properties: Default::default(),
        min_connections: 0,
        max_connections: 4,
        warning_size: None,
        wait_timeout_millis: 1_000,
        max_inactive_time_secs: None,
        max_age_minutes: 0,
        trim_pool_freq_secs: 30,
        heartbeat_freq_secs: 0,
        heartbeat_timeout_seconds: 5,
        heartbeat_sql: None,
        leak_time_minutes: 60,
        capture_stack_trace: false,
        max_stack_trace_size: 5,
        isolation_level: None,
        auto_commit: true,
        pstmt_cache_size: 8,
        acquire_slow_threshold_millis: 2_000,
    }
}
