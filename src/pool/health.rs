//! Background health and maintenance task.
//!
//! A single timer fires every `heartbeatFreqSecs` (the monitor does not
//! exist at all when that's 0). Each tick: trim, gated internally so it
//! actually runs at most once per `trimPoolFreqMs`, then a liveness probe
//! that drives the UP/DOWN transition — the same shape as sqlx-core's
//! `conn_reaper` in `pool/inner.rs` (a spawned task holding an `Arc` to the
//! shared pool state, cancelled via a oneshot, `tokio::time::interval`
//! instead of sleep-after-work to avoid drift).

use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pool::inner::PoolInner;
use crate::pool::session::PooledSession;
use crate::session::{Session, SessionFactory};

pub(crate) struct HealthMonitor {
    cancel: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Returns `None` when `heartbeatFreqSecs` is 0 — the monitor is
    /// disabled entirely rather than spawned and immediately idle.
    pub fn spawn<F: SessionFactory>(pool: std::sync::Arc<PoolInner<F>>) -> Option<Self> {
        let freq = pool.config.heartbeat_freq()?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run(pool, freq, cancel_rx));
        Some(Self {
            cancel: Some(cancel_tx),
            handle: Some(handle),
        })
    }

    /// Cancels the task and waits for its current tick to finish. Safe to
    /// call more than once; a second call is a no-op — the flag here just
    /// makes repeat calls harmless rather than relying on the caller to
    /// track shutdown state.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run<F: SessionFactory>(
    pool: std::sync::Arc<PoolInner<F>>,
    freq: std::time::Duration,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(freq);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let trim_gate = pool.config.trim_pool_freq();
    let mut last_trim: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut cancel => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                if last_trim.map_or(true, |t| now.duration_since(t) >= trim_gate) {
                    trim_once(&pool).await;
                    last_trim = Some(now);
                }
                let healthy = run_probe_once(&pool).await;
                pool.note_liveness(healthy).await;
            }
        }
    }
}

async fn trim_once<F: SessionFactory>(pool: &std::sync::Arc<PoolInner<F>>) {
    let now_ms = crate::pool::inner::now_ms();
    let max_inactive_ms = pool.config.max_inactive().map(|d| d.as_millis() as u64);
    let max_age_ms = pool.config.max_age().map(|d| d.as_millis() as u64);

    for session in pool.queue.trim(max_inactive_ms, max_age_ms, now_ms) {
        tracing::debug!(pool = %pool.config.pool_name, "trimming idle session");
        Box::new(session).close().await;
    }
}

/// Validates a pooled session's liveness and returns it, exercising the
/// actual idle/free set rather than a disposable connection. Exposed to
/// `inner.rs` so a force-close return can trigger one cycle of this without
/// waiting for the next scheduled tick.
///
/// Borrowing through `Pool::borrow()` itself would block the health tick on
/// the same wait-timeout machinery a saturated-but-healthy pool's callers
/// see, risking a false `DOWN` report; this instead takes a session directly
/// off the free list when one is available, falling back to a throwaway
/// standalone session only when the pool currently has nothing free (e.g.
/// a cold pool with `minConnections == 0`).
pub(crate) async fn run_probe_once<F: SessionFactory>(pool: &std::sync::Arc<PoolInner<F>>) -> bool {
    let timeout = pool.config.heartbeat_timeout();
    let now_ms = crate::pool::inner::now_ms();

    if let Some(handoff) = pool.queue.try_take_free(now_ms) {
        let mut probe = PooledSession::new_pooled(
            handoff.id,
            handoff.session,
            handoff.created_at_ms,
            std::sync::Arc::clone(pool),
            handoff.reclaimed,
            pool.config.pstmt_cache_size,
        );

        let healthy = match pool.config.heartbeat_sql.as_deref() {
            Some(sql) => probe.get_mut().execute(sql, timeout).await.is_ok(),
            None => probe.get_mut().is_valid(timeout).await,
        };

        if !healthy {
            probe.mark_broken();
        }
        probe.close().await;
        return healthy;
    }

    let mut session = match pool.factory.open(&pool.base_credentials).await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(pool = %pool.config.pool_name, error = %err, "heartbeat probe could not open a session");
            return false;
        }
    };

    let healthy = match pool.config.heartbeat_sql.as_deref() {
        Some(sql) => session.execute(sql, timeout).await.is_ok(),
        None => session.is_valid(timeout).await,
    };

    Box::new(session).close().await;
    healthy
}
