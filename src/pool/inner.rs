//! The public contract: `Pool<F>` owns configuration, the queue, the health
//! monitor, and the notification bridge to the alert sink and pool
//! listener — the same role sqlx-core's `Pool<DB>(Arc<SharedPool>)` plays
//! over its `PoolInner`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::alert::{AlertSink, NoopAlertSink};
use crate::config::PoolConfig;
use crate::error::{BusySnapshot, Error, Result};
use crate::listener::{NoopPoolListener, PoolListener};
use tokio::sync::oneshot;

use crate::pool::health::HealthMonitor;
use crate::pool::queue::{AcquireStep, GrowthPermit, HandoffSlot, PoolStatus, ReleaseOutcome, SessionQueue};
use crate::pool::session::PooledSession;
use crate::session::{Credentials, Session, SessionFactory};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn capture_stack(max_lines: usize) -> String {
    let backtrace = std::backtrace::Backtrace::force_capture();
    format!("{backtrace}")
        .lines()
        .take(max_lines.max(1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Default)]
struct TimingStats {
    count: u64,
    total_micros: u64,
    hwm_micros: u64,
}

/// Aggregated borrow-hold timing.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStatistics {
    pub count: u64,
    pub total_micros: u64,
    pub hwm_micros: u64,
    pub avg_micros: u64,
}

struct LivenessState {
    up: AtomicBool,
    down_alert_sent: AtomicBool,
    down_reason: Mutex<Option<String>>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self {
            up: AtomicBool::new(true),
            down_alert_sent: AtomicBool::new(false),
            down_reason: Mutex::new(None),
        }
    }
}

pub(crate) struct PoolInner<F: SessionFactory> {
    pub(crate) config: PoolConfig,
    pub(crate) factory: F,
    pub(crate) base_credentials: Credentials,
    pub(crate) queue: SessionQueue<F::Session>,
    alert: Arc<dyn AlertSink>,
    listener: Arc<dyn PoolListener>,
    liveness: LivenessState,
    health: Mutex<Option<HealthMonitor>>,
    stats: Mutex<TimingStats>,
    standalone_ids: AtomicU64,
}

impl<F: SessionFactory> PoolInner<F> {
    /// Drives the `UP`/`DOWN` state machine. Only the actual edge triggers
    /// an alert and a `reset()`; repeated probe results of the same
    /// polarity are no-ops beyond the boolean flip itself.
    pub(crate) async fn note_liveness(&self, healthy: bool) {
        if healthy {
            let was_down = !self.liveness.up.swap(true, Ordering::SeqCst);
            if was_down {
                // Clear before notifying: a re-entrant borrow from inside
                // the alert callback must not recurse into another
                // transition.
                self.liveness.down_alert_sent.store(false, Ordering::SeqCst);
                *self.liveness.down_reason.lock().unwrap() = None;
                tracing::info!(pool = %self.config.pool_name, "backend is back up");
                self.alert.on_up(&self.config.pool_name);
                self.reset_internal().await;
            }
        } else {
            let was_up = self.liveness.up.swap(false, Ordering::SeqCst);
            if was_up {
                *self.liveness.down_reason.lock().unwrap() =
                    Some("backend probe or session creation failed".to_string());
                if !self.liveness.down_alert_sent.swap(true, Ordering::SeqCst) {
                    tracing::error!(pool = %self.config.pool_name, "backend is down");
                    self.alert.on_down(&self.config.pool_name);
                }
                self.reset_internal().await;
            }
        }
    }

    /// Shared body of `Pool::reset()` and the post-transition cleanup in
    /// `note_liveness`: closes free sessions (they may be stale after an
    /// outage), clears the warning latch, and reclaims leaked borrows.
    async fn reset_internal(&self) {
        self.queue.reset_warning_latch();

        for session in self.queue.drain_free() {
            Box::new(session).close().await;
        }

        let leak_ms = self.config.leak_time().as_millis() as u64;
        let now = now_ms();
        for leak in self.queue.close_busy_connections(leak_ms, now) {
            tracing::warn!(
                pool = %self.config.pool_name,
                session_id = leak.id,
                idle_for_ms = now.saturating_sub(leak.last_used_at_ms),
                borrow_stack = leak.borrow_stack.as_deref().unwrap_or("<not captured>"),
                "reclaiming leaked session"
            );
        }
    }

    fn record_borrow(&self, held: Duration) {
        let micros = held.as_micros().min(u128::from(u64::MAX)) as u64;
        let mut stats = self.stats.lock().unwrap();
        stats.count += 1;
        stats.total_micros = stats.total_micros.saturating_add(micros);
        if micros > stats.hwm_micros {
            stats.hwm_micros = micros;
        }
    }

    /// Release path shared by `PooledSession::close` and its `Drop` impl.
    pub(crate) async fn finish_return(
        self: Arc<Self>,
        id: u64,
        session: F::Session,
        created_at_ms: u64,
        held: Duration,
        force_close: bool,
    ) {
        self.record_borrow(held);

        let now = now_ms();
        let max_age_ms = self.config.max_age().map(|d| d.as_millis() as u64);
        let (outcome, warning) = self.queue.release(id, session, created_at_ms, now, force_close, max_age_ms);

        if !force_close {
            self.listener.before_return(id);
        }

        let mut trigger_health_check = false;
        match outcome {
            ReleaseOutcome::Destroyed(session) => {
                tracing::debug!(pool = %self.config.pool_name, session_id = id, force_close, "destroying session on return");
                Box::new(session).close().await;
                trigger_health_check = force_close;
            }
            ReleaseOutcome::KeptFree => {
                tracing::trace!(pool = %self.config.pool_name, session_id = id, "session returned to free list");
            }
            ReleaseOutcome::HandedOff => {
                tracing::trace!(pool = %self.config.pool_name, session_id = id, "session handed directly to a waiter");
            }
            ReleaseOutcome::DestroyedAndRegrow { destroyed, permit, waiter_tx } => {
                tracing::debug!(pool = %self.config.pool_name, session_id = id, force_close, "destroying session on return, regrowing for a stranded waiter");
                Box::new(destroyed).close().await;
                trigger_health_check = force_close;
                self.clone().regrow_for_waiter(permit, waiter_tx).await;
            }
            ReleaseOutcome::AlreadyGone => {}
        }

        if let Some(w) = warning {
            self.alert.on_warning(
                &format!("{} pool near capacity", self.config.pool_name),
                &format!("busy={} warningSize={}", w.busy, w.warning_size),
            );
        }

        if trigger_health_check {
            // Triggers a health check asynchronously — spawned so a
            // force-close return never recurses synchronously into its
            // own check.
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                let healthy = crate::pool::health::run_probe_once(&pool).await;
                pool.note_liveness(healthy).await;
            });
        }
    }

    /// Opens a replacement session for a waiter stranded by a destroyed
    /// return (see `ReleaseOutcome::DestroyedAndRegrow`) and delivers it
    /// directly. If the waiter gave up in the meantime, the new session is
    /// routed back through the free list or the next waiter instead of
    /// being lost.
    async fn regrow_for_waiter(self: Arc<Self>, permit: GrowthPermit, waiter_tx: oneshot::Sender<HandoffSlot<F::Session>>) {
        match self.factory.open(&self.base_credentials).await {
            Ok(session) => {
                let created = now_ms();
                if let Some((id, session)) = self.queue.commit_growth_for_waiter(permit, waiter_tx, session, created, created) {
                    let (outcome, warning) = self.queue.place_or_serve(id, session, created, created);
                    if let ReleaseOutcome::Destroyed(session) = outcome {
                        Box::new(session).close().await;
                    }
                    if let Some(w) = warning {
                        self.alert.on_warning(
                            &format!("{} pool near capacity", self.config.pool_name),
                            &format!("busy={} warningSize={}", w.busy, w.warning_size),
                        );
                    }
                }
            }
            Err(err) => {
                self.queue.abort_growth(permit);
                tracing::warn!(
                    pool = %self.config.pool_name,
                    error = %err,
                    "failed to open a replacement session for a stranded waiter"
                );
                self.note_liveness(false).await;
            }
        }
    }
}

/// Builds a [`Pool`], performing the initial fill up to `minConnections`
/// and spawning the health monitor.
pub struct PoolBuilder<F: SessionFactory> {
    config: PoolConfig,
    factory: F,
    alert: Arc<dyn AlertSink>,
    listener: Arc<dyn PoolListener>,
}

impl<F: SessionFactory> PoolBuilder<F> {
    pub fn new(config: PoolConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            alert: Arc::new(NoopAlertSink),
            listener: Arc::new(NoopPoolListener),
        }
    }

    pub fn alert_sink(mut self, alert: Arc<dyn AlertSink>) -> Self {
        self.alert = alert;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn PoolListener>) -> Self {
        self.listener = listener;
        self
    }

    pub async fn build(self) -> Result<Pool<F>> {
        self.config.validate()?;

        let base_credentials = Credentials {
            url: self.config.url.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            properties: self.config.custom_properties.clone(),
            isolation_level: self.config.isolation_level,
            auto_commit: self.config.auto_commit,
        };

        let queue = SessionQueue::new(
            self.config.min_connections,
            self.config.max_connections,
            self.config.warning_size(),
        );

        let inner = Arc::new(PoolInner {
            config: self.config,
            factory: self.factory,
            base_credentials,
            queue,
            alert: self.alert,
            listener: self.listener,
            liveness: LivenessState::default(),
            health: Mutex::new(None),
            stats: Mutex::new(TimingStats::default()),
            standalone_ids: AtomicU64::new(0),
        });

        // Initial fill: failures are logged but do not abort construction;
        // the pool simply starts DOWN and recovers on the first successful
        // probe.
        let mut fill_failed = false;
        while let Some(permit) = inner.queue.reserve_min_growth() {
            match inner.factory.open(&inner.base_credentials).await {
                Ok(session) => {
                    let created = now_ms();
                    inner.queue.commit_min_growth(permit, session, created, created);
                }
                Err(err) => {
                    inner.queue.abort_growth(permit);
                    tracing::warn!(pool = %inner.config.pool_name, error = %err, "initial fill failed to reach minConnections");
                    fill_failed = true;
                    break;
                }
            }
        }
        if fill_failed {
            inner.note_liveness(false).await;
        }

        if let Some(monitor) = HealthMonitor::spawn(inner.clone()) {
            *inner.health.lock().unwrap() = Some(monitor);
        }

        tracing::info!(
            pool = %inner.config.pool_name,
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "pool ready"
        );

        Ok(Pool(inner))
    }
}

/// A handle to a running connection pool. Cheap to clone; clones share the
/// same underlying queue, configuration, and health monitor.
pub struct Pool<F: SessionFactory>(Arc<PoolInner<F>>);

impl<F: SessionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Pool(Arc::clone(&self.0))
    }
}

impl<F: SessionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.0.config.pool_name)
            .field("up", &self.is_up())
            .finish()
    }
}

impl<F: SessionFactory> Pool<F> {
    pub fn builder(config: PoolConfig, factory: F) -> PoolBuilder<F> {
        PoolBuilder::new(config, factory)
    }

    pub fn name(&self) -> &str {
        &self.0.config.pool_name
    }

    pub fn is_up(&self) -> bool {
        self.0.liveness.up.load(Ordering::SeqCst)
    }

    /// Admission protocol: serve from the free list, grow if under
    /// capacity, otherwise queue as a waiter.
    pub async fn borrow(&self) -> Result<PooledSession<F>> {
        self.acquire(None).await
    }

    /// Returns an **unpooled** session created on demand with overridden
    /// credentials. Never added to the pool; closing it tears it down
    /// fully.
    pub async fn borrow_with(&self, username: impl Into<String>, password: impl Into<String>) -> Result<PooledSession<F>> {
        let mut creds = self.0.base_credentials.clone();
        creds.username = username.into();
        creds.password = password.into();

        let created = now_ms();
        let session = self.0.factory.open(&creds).await.map_err(Error::backend_down)?;

        let n = self.0.standalone_ids.fetch_add(1, Ordering::Relaxed);
        let id = u64::MAX - n;
        Ok(PooledSession::new_standalone(id, session, created, self.0.config.pstmt_cache_size))
    }

    async fn acquire(&self, override_creds: Option<Credentials>) -> Result<PooledSession<F>> {
        let inner = &self.0;
        let start = Instant::now();
        let wait_timeout = inner.config.wait_timeout();

        let handoff = loop {
            match inner.queue.begin_acquire(now_ms()) {
                AcquireStep::Ready(slot) => break slot,
                AcquireStep::Grow(permit) => {
                    let creds = override_creds.as_ref().unwrap_or(&inner.base_credentials);
                    match inner.factory.open(creds).await {
                        Ok(session) => {
                            let created = now_ms();
                            break inner.queue.commit_growth(permit, session, created, created);
                        }
                        Err(err) => {
                            inner.queue.abort_growth(permit);
                            inner.note_liveness(false).await;
                            return Err(Error::backend_down(err));
                        }
                    }
                }
                AcquireStep::Wait { token, mut rx } => {
                    let remaining = wait_timeout.saturating_sub(start.elapsed());
                    tokio::select! {
                        res = &mut rx => {
                            match res {
                                Ok(slot) => break slot,
                                Err(_) => return Err(Error::PoolClosed),
                            }
                        }
                        _ = tokio::time::sleep(remaining) => {
                            if inner.queue.remove_waiter(token) {
                                tracing::warn!(
                                    pool = %inner.config.pool_name,
                                    waited_ms = start.elapsed().as_millis() as u64,
                                    "acquire timed out"
                                );
                                return Err(Error::PoolTimeout {
                                    waited: start.elapsed(),
                                    snapshot: inner.queue.diagnostic_snapshot(),
                                });
                            }
                            // Direct-handoff race: a session was (or is
                            // about to be) delivered between expiry and
                            // removal. Accept it rather than losing it.
                            match rx.await {
                                Ok(slot) => break slot,
                                Err(_) => return Err(Error::PoolClosed),
                            }
                        }
                    }
                }
                AcquireStep::Closed => return Err(Error::PoolClosed),
            }
        };

        let elapsed = start.elapsed();
        if elapsed > inner.config.acquire_slow_threshold() {
            tracing::warn!(
                pool = %inner.config.pool_name,
                session_id = handoff.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow acquire"
            );
        }

        if inner.config.capture_stack_trace {
            inner.queue.set_borrow_stack(handoff.id, capture_stack(inner.config.max_stack_trace_size));
        }

        inner.listener.after_borrow(handoff.id);

        Ok(PooledSession::new_pooled(
            handoff.id,
            handoff.session,
            handoff.created_at_ms,
            self.0.clone(),
            handoff.reclaimed,
            inner.config.pstmt_cache_size,
        ))
    }

    pub fn status(&self, reset_counters: bool) -> PoolStatus {
        self.0.queue.status(reset_counters)
    }

    pub fn statistics(&self, reset_counters: bool) -> PoolStatistics {
        let mut stats = self.0.stats.lock().unwrap();
        let snapshot = PoolStatistics {
            count: stats.count,
            total_micros: stats.total_micros,
            hwm_micros: stats.hwm_micros,
            avg_micros: if stats.count > 0 { stats.total_micros / stats.count } else { 0 },
        };
        if reset_counters {
            *stats = TimingStats::default();
        }
        snapshot
    }

    /// Reducing `max` does not forcibly close currently-busy sessions; they
    /// are destroyed on return once the pool is found above the new max.
    pub fn resize(&self, min: Option<u32>, max: Option<u32>, warning: Option<u32>) {
        self.0.queue.resize(min, max, warning);
    }

    /// Closes free sessions, resets the warning latch, and reclaims any
    /// session busy longer than `leakTimeMinutes`.
    pub async fn reset(&self) {
        self.0.reset_internal().await;
    }

    pub fn dump_busy_information(&self) -> String {
        self.0.queue.diagnostic_snapshot().to_string()
    }

    pub fn get_busy_information(&self) -> BusySnapshot {
        self.0.queue.diagnostic_snapshot()
    }

    /// Cancels the health monitor, drains free sessions, waits (bounded by
    /// `waitTimeoutMillis`) for busy sessions to return, then optionally
    /// deregisters the driver. After this, `borrow` fails with `PoolClosed`.
    pub async fn shutdown(&self, deregister_driver: bool) {
        self.0.queue.mark_closed();

        let deadline = Instant::now() + self.0.config.wait_timeout();
        while self.0.queue.busy_len() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let monitor = self.0.health.lock().unwrap().take();
        if let Some(mut monitor) = monitor {
            monitor.shutdown().await;
        }

        for session in self.0.queue.drain_free() {
            Box::new(session).close().await;
        }

        if deregister_driver {
            tracing::info!(pool = %self.0.config.pool_name, "deregistering driver");
        }
        tracing::info!(pool = %self.0.config.pool_name, "pool shut down");
    }
}
