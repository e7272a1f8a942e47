//! The central data structure: free/busy collections, the waiter FIFO,
//! counters, and the admission/release/trim/leak protocols.
//!
//! Every method here is synchronous and holds the lock for O(1)-ish work
//! only — no `.await` ever happens while `state` is locked. Session creation
//! and liveness probes run in `inner.rs`, outside this lock, coordinating
//! through the small step types below — the same split sqlx-core draws
//! between `pool/queue.rs` (bookkeeping) and `pool/inner.rs` (the I/O that
//! surrounds it).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{BusySessionInfo, BusySnapshot};
use crate::session::Session;

pub(crate) struct FreeSlot<S> {
    pub id: u64,
    pub session: S,
    pub created_at_ms: u64,
    pub last_used_at_ms: u64,
}

struct BusyMarker {
    created_at_ms: u64,
    last_used_at_ms: u64,
    borrow_stack: Option<String>,
    reclaimed: Arc<AtomicBool>,
}

struct Waiter<S> {
    token: u64,
    tx: oneshot::Sender<HandoffSlot<S>>,
}

/// A session being handed to a borrower, whether popped from `free`,
/// freshly created, or handed off directly on release.
pub(crate) struct HandoffSlot<S> {
    pub id: u64,
    pub session: S,
    pub created_at_ms: u64,
    pub reclaimed: Arc<AtomicBool>,
}

/// A reservation to create a new session. Must be resolved with
/// [`SessionQueue::commit_growth`] or [`SessionQueue::abort_growth`].
pub(crate) struct GrowthPermit {
    id: u64,
}

pub(crate) enum AcquireStep<S> {
    Ready(HandoffSlot<S>),
    Grow(GrowthPermit),
    Wait {
        token: u64,
        rx: oneshot::Receiver<HandoffSlot<S>>,
    },
    Closed,
}

pub(crate) enum ReleaseOutcome<S> {
    /// Returned to the free list.
    KeptFree,
    /// Handed directly to a waiter; nothing for the caller to destroy.
    HandedOff,
    /// Must be destroyed by the caller (outside the lock).
    Destroyed(S),
    /// The returned session is being destroyed, but a waiter was queued with
    /// nothing free to give it; a growth slot was reserved in the same
    /// critical section so the caller can open a replacement and deliver it
    /// straight to that waiter instead of leaving it parked indefinitely.
    DestroyedAndRegrow {
        destroyed: S,
        permit: GrowthPermit,
        waiter_tx: oneshot::Sender<HandoffSlot<S>>,
    },
    /// Not found in `busy` — a double close. Idempotent no-op.
    AlreadyGone,
}

/// Fired when `busy` first crosses `warningSize` since the last reset.
pub(crate) struct WarningEvent {
    pub busy: u32,
    pub warning_size: u32,
}

pub(crate) struct LeakDiagnostic {
    pub id: u64,
    pub last_used_at_ms: u64,
    pub borrow_stack: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolStatus {
    pub min_size: u32,
    pub max_size: u32,
    pub free: usize,
    pub busy: usize,
    pub waiting: usize,
    pub high_water_mark: u64,
    pub wait_count: u64,
    pub hit_count: u64,
}

struct QueueState<S> {
    free: VecDeque<FreeSlot<S>>,
    busy: HashMap<u64, BusyMarker>,
    waiters: VecDeque<Waiter<S>>,
    next_id: u64,
    next_waiter_token: u64,
    pending_growth: u32,
    created_count: u64,
    destroyed_count: u64,
    high_water_mark: u64,
    hit_count: u64,
    wait_count: u64,
    min_size: u32,
    max_size: u32,
    warning_size: u32,
    warning_latched: bool,
    closed: bool,
}

pub(crate) struct SessionQueue<S> {
    state: Mutex<QueueState<S>>,
}

impl<S: Session> SessionQueue<S> {
    pub fn new(min_size: u32, max_size: u32, warning_size: u32) -> Self {
        Self {
            state: Mutex::new(QueueState {
                free: VecDeque::new(),
                busy: HashMap::new(),
                waiters: VecDeque::new(),
                next_id: 0,
                next_waiter_token: 0,
                pending_growth: 0,
                created_count: 0,
                destroyed_count: 0,
                high_water_mark: 0,
                hit_count: 0,
                wait_count: 0,
                min_size,
                max_size,
                warning_size,
                warning_latched: false,
                closed: false,
            }),
        }
    }

    pub fn mark_closed(&self) {
        self.state.lock().unwrap().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn resize(&self, min: Option<u32>, max: Option<u32>, warning: Option<u32>) {
        let mut st = self.state.lock().unwrap();
        if let Some(v) = min {
            st.min_size = v;
        }
        if let Some(v) = max {
            st.max_size = v;
        }
        if let Some(v) = warning {
            st.warning_size = v;
        }
    }

    /// Admission protocol: serve from free, grow if under capacity,
    /// otherwise enqueue a waiter.
    pub fn begin_acquire(&self, now_ms: u64) -> AcquireStep<S> {
        let mut st = self.state.lock().unwrap();
        st.hit_count += 1;

        if st.closed {
            return AcquireStep::Closed;
        }

        if let Some(handoff) = Self::pop_free_into_busy(&mut st, now_ms) {
            return AcquireStep::Ready(handoff);
        }

        let total = st.free.len() as u32 + st.busy.len() as u32 + st.pending_growth;
        if total < st.max_size {
            st.next_id += 1;
            let id = st.next_id;
            st.pending_growth += 1;
            return AcquireStep::Grow(GrowthPermit { id });
        }

        st.wait_count += 1;
        st.next_waiter_token += 1;
        let token = st.next_waiter_token;
        let (tx, rx) = oneshot::channel();
        st.waiters.push_back(Waiter { token, tx });
        AcquireStep::Wait { token, rx }
    }

    pub fn commit_growth(&self, permit: GrowthPermit, session: S, created_at_ms: u64, now_ms: u64) -> HandoffSlot<S> {
        let mut st = self.state.lock().unwrap();
        st.pending_growth -= 1;
        st.created_count += 1;
        let reclaimed = Arc::new(AtomicBool::new(false));
        st.busy.insert(
            permit.id,
            BusyMarker {
                created_at_ms,
                last_used_at_ms: now_ms,
                borrow_stack: None,
                reclaimed: reclaimed.clone(),
            },
        );
        let busy_len = st.busy.len() as u64;
        if busy_len > st.high_water_mark {
            st.high_water_mark = busy_len;
        }
        HandoffSlot {
            id: permit.id,
            session,
            created_at_ms,
            reclaimed,
        }
    }

    pub fn abort_growth(&self, permit: GrowthPermit) {
        let mut st = self.state.lock().unwrap();
        st.pending_growth -= 1;
        let _ = permit;
    }

    /// Reserves a growth slot to top the pool up to `minSize`, independent
    /// of any borrower. Used by the health monitor's trim cycle.
    pub fn reserve_min_growth(&self) -> Option<GrowthPermit> {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return None;
        }
        let total = st.free.len() as u32 + st.busy.len() as u32 + st.pending_growth;
        if total < st.min_size {
            st.next_id += 1;
            let id = st.next_id;
            st.pending_growth += 1;
            Some(GrowthPermit { id })
        } else {
            None
        }
    }

    pub fn commit_min_growth(&self, permit: GrowthPermit, session: S, created_at_ms: u64, now_ms: u64) {
        let mut st = self.state.lock().unwrap();
        st.pending_growth -= 1;
        st.created_count += 1;
        st.free.push_back(FreeSlot {
            id: permit.id,
            session,
            created_at_ms,
            last_used_at_ms: now_ms,
        });
    }

    /// Removes a waiter before its deadline fires. Returns `false` if the
    /// waiter was already popped by a concurrent `release` — the caller
    /// must then await its receiver rather than report a timeout, since a
    /// session may already be in flight to it.
    pub fn remove_waiter(&self, token: u64) -> bool {
        let mut st = self.state.lock().unwrap();
        if let Some(pos) = st.waiters.iter().position(|w| w.token == token) {
            st.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn set_borrow_stack(&self, id: u64, stack: String) {
        let mut st = self.state.lock().unwrap();
        if let Some(marker) = st.busy.get_mut(&id) {
            marker.borrow_stack = Some(stack);
        }
    }

    /// Release protocol: return to free, hand off to a waiter, or destroy.
    pub fn release(
        &self,
        id: u64,
        session: S,
        created_at_ms: u64,
        now_ms: u64,
        force_close: bool,
        max_age_ms: Option<u64>,
    ) -> (ReleaseOutcome<S>, Option<WarningEvent>) {
        let mut st = self.state.lock().unwrap();

        if st.busy.remove(&id).is_none() {
            return (ReleaseOutcome::AlreadyGone, None);
        }

        let total_after = st.free.len() as u32 + st.busy.len() as u32 + st.pending_growth;
        let age_ok = max_age_ms.map_or(true, |max| now_ms.saturating_sub(created_at_ms) < max);
        let over_capacity = total_after >= st.max_size;
        let returning_ineligible = force_close || !age_ok || over_capacity || st.closed;

        if !returning_ineligible {
            if let Some(waiter) = st.waiters.pop_front() {
                let reclaimed = Arc::new(AtomicBool::new(false));
                let handoff = HandoffSlot {
                    id,
                    session,
                    created_at_ms,
                    reclaimed: Arc::clone(&reclaimed),
                };
                match waiter.tx.send(handoff) {
                    Ok(()) => {
                        st.busy.insert(
                            id,
                            BusyMarker {
                                created_at_ms,
                                last_used_at_ms: now_ms,
                                borrow_stack: None,
                                reclaimed,
                            },
                        );
                        let busy_len = st.busy.len() as u64;
                        if busy_len > st.high_water_mark {
                            st.high_water_mark = busy_len;
                        }
                        let warn = self.maybe_warn(&mut st);
                        return (ReleaseOutcome::HandedOff, warn);
                    }
                    Err(handoff) => {
                        // Waiter's task was cancelled; the session is
                        // undamaged, fall through to the free-list path.
                        st.free.push_back(FreeSlot {
                            id: handoff.session_id(),
                            session: handoff.session,
                            created_at_ms: handoff.created_at_ms,
                            last_used_at_ms: now_ms,
                        });
                        let warn = self.maybe_warn(&mut st);
                        return (ReleaseOutcome::KeptFree, warn);
                    }
                }
            }

            st.free.push_back(FreeSlot {
                id,
                session,
                created_at_ms,
                last_used_at_ms: now_ms,
            });
            let warn = self.maybe_warn(&mut st);
            return (ReleaseOutcome::KeptFree, warn);
        }

        // The returning session is being destroyed. If a waiter exists,
        // try to satisfy it from `free` instead before giving up on it.
        st.destroyed_count += 1;

        if let Some(waiter) = st.waiters.pop_front() {
            if let Some(free_slot) = st.free.pop_back() {
                let reclaimed = Arc::new(AtomicBool::new(false));
                let handoff = HandoffSlot {
                    id: free_slot.id,
                    session: free_slot.session,
                    created_at_ms: free_slot.created_at_ms,
                    reclaimed: Arc::clone(&reclaimed),
                };
                match waiter.tx.send(handoff) {
                    Ok(()) => {
                        st.busy.insert(
                            free_slot.id,
                            BusyMarker {
                                created_at_ms: free_slot.created_at_ms,
                                last_used_at_ms: now_ms,
                                borrow_stack: None,
                                reclaimed,
                            },
                        );
                        let busy_len = st.busy.len() as u64;
                        if busy_len > st.high_water_mark {
                            st.high_water_mark = busy_len;
                        }
                    }
                    Err(handoff) => {
                        st.free.push_back(FreeSlot {
                            id: handoff.session_id(),
                            session: handoff.session,
                            created_at_ms: handoff.created_at_ms,
                            last_used_at_ms: now_ms,
                        });
                    }
                }
            } else {
                // Nothing free to give this waiter, but destroying the
                // returning session just freed a capacity slot. Reserve a
                // growth permit in this same critical section and hand the
                // waiter's sender back to the caller, which opens a
                // replacement session outside the lock and delivers it
                // straight to this waiter — otherwise it would sit parked
                // until its own wait timeout with no mechanism to wake it.
                let total = st.free.len() as u32 + st.busy.len() as u32 + st.pending_growth;
                if total < st.max_size {
                    st.next_id += 1;
                    let id = st.next_id;
                    st.pending_growth += 1;
                    let warn = self.maybe_warn(&mut st);
                    return (
                        ReleaseOutcome::DestroyedAndRegrow {
                            destroyed: session,
                            permit: GrowthPermit { id },
                            waiter_tx: waiter.tx,
                        },
                        warn,
                    );
                }
                st.waiters.push_front(waiter);
            }
        }

        let warn = self.maybe_warn(&mut st);
        (ReleaseOutcome::Destroyed(session), warn)
    }

    /// Completes a growth reservation made on behalf of a specific waiter
    /// (see [`ReleaseOutcome::DestroyedAndRegrow`]). Delivers `session`
    /// straight to that waiter. If the waiter already gave up (its receiver
    /// dropped), returns the session's assigned id and the session itself so
    /// the caller can route it back through [`SessionQueue::place_or_serve`]
    /// instead of losing it.
    pub fn commit_growth_for_waiter(
        &self,
        permit: GrowthPermit,
        waiter_tx: oneshot::Sender<HandoffSlot<S>>,
        session: S,
        created_at_ms: u64,
        now_ms: u64,
    ) -> Option<(u64, S)> {
        let mut st = self.state.lock().unwrap();
        st.pending_growth -= 1;
        st.created_count += 1;
        let id = permit.id;
        let reclaimed = Arc::new(AtomicBool::new(false));
        let handoff = HandoffSlot {
            id,
            session,
            created_at_ms,
            reclaimed: Arc::clone(&reclaimed),
        };
        match waiter_tx.send(handoff) {
            Ok(()) => {
                st.busy.insert(
                    id,
                    BusyMarker {
                        created_at_ms,
                        last_used_at_ms: now_ms,
                        borrow_stack: None,
                        reclaimed,
                    },
                );
                let busy_len = st.busy.len() as u64;
                if busy_len > st.high_water_mark {
                    st.high_water_mark = busy_len;
                }
                None
            }
            Err(handoff) => Some((handoff.session_id(), handoff.session)),
        }
    }

    /// Places a freshly created session that is not yet tracked anywhere in
    /// `busy`/`free`: hands it to the next waiter if one is queued, otherwise
    /// adds it to the free list. Used to recover a replacement session whose
    /// intended waiter (from `commit_growth_for_waiter`) already gave up.
    pub fn place_or_serve(&self, id: u64, session: S, created_at_ms: u64, now_ms: u64) -> (ReleaseOutcome<S>, Option<WarningEvent>) {
        let mut st = self.state.lock().unwrap();

        if st.closed {
            return (ReleaseOutcome::Destroyed(session), None);
        }

        if let Some(waiter) = st.waiters.pop_front() {
            let reclaimed = Arc::new(AtomicBool::new(false));
            let handoff = HandoffSlot {
                id,
                session,
                created_at_ms,
                reclaimed: Arc::clone(&reclaimed),
            };
            match waiter.tx.send(handoff) {
                Ok(()) => {
                    st.busy.insert(
                        id,
                        BusyMarker {
                            created_at_ms,
                            last_used_at_ms: now_ms,
                            borrow_stack: None,
                            reclaimed,
                        },
                    );
                    let busy_len = st.busy.len() as u64;
                    if busy_len > st.high_water_mark {
                        st.high_water_mark = busy_len;
                    }
                    let warn = self.maybe_warn(&mut st);
                    return (ReleaseOutcome::HandedOff, warn);
                }
                Err(handoff) => {
                    st.free.push_back(FreeSlot {
                        id: handoff.session_id(),
                        session: handoff.session,
                        created_at_ms: handoff.created_at_ms,
                        last_used_at_ms: now_ms,
                    });
                    let warn = self.maybe_warn(&mut st);
                    return (ReleaseOutcome::KeptFree, warn);
                }
            }
        }

        st.free.push_back(FreeSlot {
            id,
            session,
            created_at_ms,
            last_used_at_ms: now_ms,
        });
        let warn = self.maybe_warn(&mut st);
        (ReleaseOutcome::KeptFree, warn)
    }

    /// Borrows one currently-free session for the health monitor's liveness
    /// probe without growing the pool or registering a waiter. Returns
    /// `None` if nothing is free right now.
    pub fn try_take_free(&self, now_ms: u64) -> Option<HandoffSlot<S>> {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return None;
        }
        Self::pop_free_into_busy(&mut st, now_ms)
    }

    fn pop_free_into_busy(st: &mut QueueState<S>, now_ms: u64) -> Option<HandoffSlot<S>> {
        let slot = st.free.pop_back()?;
        let id = slot.id;
        let reclaimed = Arc::new(AtomicBool::new(false));
        st.busy.insert(
            id,
            BusyMarker {
                created_at_ms: slot.created_at_ms,
                last_used_at_ms: now_ms,
                borrow_stack: None,
                reclaimed: Arc::clone(&reclaimed),
            },
        );
        let busy_len = st.busy.len() as u64;
        if busy_len > st.high_water_mark {
            st.high_water_mark = busy_len;
        }
        Some(HandoffSlot {
            id,
            session: slot.session,
            created_at_ms: slot.created_at_ms,
            reclaimed,
        })
    }

    fn maybe_warn(&self, st: &mut QueueState<S>) -> Option<WarningEvent> {
        if !st.warning_latched && st.busy.len() as u32 >= st.warning_size {
            st.warning_latched = true;
            Some(WarningEvent {
                busy: st.busy.len() as u32,
                warning_size: st.warning_size,
            })
        } else {
            None
        }
    }

    pub fn reset_warning_latch(&self) {
        self.state.lock().unwrap().warning_latched = false;
    }

    /// Trim protocol. Returns sessions the caller must close outside the
    /// lock.
    pub fn trim(&self, max_inactive_ms: Option<u64>, max_age_ms: Option<u64>, now_ms: u64) -> Vec<S> {
        let mut st = self.state.lock().unwrap();
        let mut removed = Vec::new();

        if let Some(max_inactive) = max_inactive_ms {
            let mut i = 0;
            while i < st.free.len() {
                let total = st.free.len() as u32 + st.busy.len() as u32;
                if total <= st.min_size {
                    break;
                }
                let idle_for = now_ms.saturating_sub(st.free[i].last_used_at_ms);
                if idle_for > max_inactive {
                    let slot = st.free.remove(i).expect("index in bounds");
                    st.destroyed_count += 1;
                    removed.push(slot.session);
                } else {
                    i += 1;
                }
            }
        }

        if let Some(max_age) = max_age_ms {
            let mut i = 0;
            while i < st.free.len() {
                let total = st.free.len() as u32 + st.busy.len() as u32;
                if total <= st.min_size {
                    break;
                }
                let age = now_ms.saturating_sub(st.free[i].created_at_ms);
                if age > max_age {
                    let slot = st.free.remove(i).expect("index in bounds");
                    st.destroyed_count += 1;
                    removed.push(slot.session);
                } else {
                    i += 1;
                }
            }
        }

        removed
    }

    /// Leak reclamation. Marks each stale busy session so the orphaned
    /// handle's eventual drop becomes a no-op towards this queue, and
    /// removes its bookkeeping immediately (the borrower is not waited on).
    pub fn close_busy_connections(&self, leak_ms: u64, now_ms: u64) -> Vec<LeakDiagnostic> {
        let mut st = self.state.lock().unwrap();

        let stale_ids: Vec<u64> = st
            .busy
            .iter()
            .filter(|(_, m)| now_ms.saturating_sub(m.last_used_at_ms) >= leak_ms)
            .map(|(id, _)| *id)
            .collect();

        let mut diagnostics = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(marker) = st.busy.remove(&id) {
                marker.reclaimed.store(true, Ordering::SeqCst);
                st.destroyed_count += 1;
                diagnostics.push(LeakDiagnostic {
                    id,
                    last_used_at_ms: marker.last_used_at_ms,
                    borrow_stack: marker.borrow_stack,
                });
            }
        }
        diagnostics
    }

    /// Drains every free session (shutdown/reset). Returns sessions the
    /// caller must close outside the lock.
    pub fn drain_free(&self) -> Vec<S> {
        let mut st = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(st.free.len());
        while let Some(slot) = st.free.pop_front() {
            st.destroyed_count += 1;
            out.push(slot.session);
        }
        out
    }

    pub fn busy_len(&self) -> usize {
        self.state.lock().unwrap().busy.len()
    }

    pub fn status(&self, reset_counters: bool) -> PoolStatus {
        let mut st = self.state.lock().unwrap();
        let snapshot = PoolStatus {
            min_size: st.min_size,
            max_size: st.max_size,
            free: st.free.len(),
            busy: st.busy.len(),
            waiting: st.waiters.len(),
            high_water_mark: st.high_water_mark,
            wait_count: st.wait_count,
            hit_count: st.hit_count,
        };
        if reset_counters {
            st.wait_count = 0;
            st.hit_count = 0;
            st.high_water_mark = st.busy.len() as u64;
        }
        snapshot
    }

    pub fn counts(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        (st.created_count, st.destroyed_count)
    }

    pub fn diagnostic_snapshot(&self) -> BusySnapshot {
        let st = self.state.lock().unwrap();
        BusySnapshot {
            free: st.free.len(),
            busy: st.busy.len(),
            waiting: st.waiters.len(),
            max_size: st.max_size,
            sessions: st
                .busy
                .iter()
                .map(|(id, m)| BusySessionInfo {
                    id: *id,
                    last_used_at_ms: m.last_used_at_ms,
                    borrow_stack: m.borrow_stack.clone(),
                })
                .collect(),
        }
    }
}

impl<S> HandoffSlot<S> {
    fn session_id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_core::future::BoxFuture;

    use super::*;
    use crate::error::Result;

    struct Dummy(u64);

    impl Session for Dummy {
        fn is_valid(&mut self, _timeout: Duration) -> BoxFuture<'_, bool> {
            Box::pin(async { true })
        }

        fn execute(&mut self, _sql: &str, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn borrow_one(q: &SessionQueue<Dummy>) -> HandoffSlot<Dummy> {
        match q.begin_acquire(0) {
            AcquireStep::Ready(slot) => slot,
            AcquireStep::Grow(permit) => {
                let id = permit.id;
                q.commit_growth(permit, Dummy(id), 0, 0)
            }
            AcquireStep::Wait { .. } | AcquireStep::Closed => panic!("expected an immediately available session"),
        }
    }

    #[test]
    fn created_count_tracks_growth_only() {
        let q = SessionQueue::new(0, 2, 2);
        let (created, destroyed) = q.counts();
        assert_eq!((created, destroyed), (0, 0));

        let a = borrow_one(&q);
        let b = borrow_one(&q);
        assert_eq!(q.counts(), (2, 0));

        // Returning within capacity and age keeps both sessions alive.
        let (outcome, _) = q.release(a.id, Dummy(a.id), a.created_at_ms, 1, false, None);
        assert!(matches!(outcome, ReleaseOutcome::KeptFree));
        let (outcome, _) = q.release(b.id, Dummy(b.id), b.created_at_ms, 1, false, None);
        assert!(matches!(outcome, ReleaseOutcome::KeptFree));

        assert_eq!(q.counts(), (2, 0));
    }

    #[test]
    fn destroyed_count_increments_on_force_close() {
        let q = SessionQueue::new(0, 1, 1);
        let a = borrow_one(&q);

        let (outcome, _) = q.release(a.id, Dummy(a.id), a.created_at_ms, 1, true, None);
        assert!(matches!(outcome, ReleaseOutcome::Destroyed(_)));
        assert_eq!(q.counts(), (1, 1));
    }

    #[test]
    fn free_plus_busy_never_exceeds_max_size() {
        let q = SessionQueue::new(0, 2, 2);
        let a = borrow_one(&q);
        let b = borrow_one(&q);

        assert!(matches!(q.begin_acquire(0), AcquireStep::Wait { .. }));

        let status = q.status(false);
        assert!(status.free + status.busy <= 2);

        let (outcome, _) = q.release(a.id, Dummy(a.id), a.created_at_ms, 1, false, None);
        // Handed directly to the waiter spawned by begin_acquire above.
        assert!(matches!(outcome, ReleaseOutcome::HandedOff));
        let _ = q.release(b.id, Dummy(b.id), b.created_at_ms, 1, false, None);
    }

    #[test]
    fn release_is_idempotent_after_leak_reclamation() {
        let q = SessionQueue::new(0, 1, 1);
        let a = borrow_one(&q);
        assert_eq!(q.busy_len(), 1);

        let diagnostics = q.close_busy_connections(0, 0);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(q.busy_len(), 0);

        // A late return for the reclaimed id is a harmless no-op.
        let (outcome, _warning) = q.release(a.id, Dummy(a.id), a.created_at_ms, 1, false, None);
        assert!(matches!(outcome, ReleaseOutcome::AlreadyGone));
        assert_eq!(q.busy_len(), 0);
    }

    #[test]
    fn handed_off_session_shares_the_reclaimed_flag_with_its_busy_marker() {
        let q = SessionQueue::new(0, 1, 1);
        let a = borrow_one(&q);

        let mut rx = match q.begin_acquire(0) {
            AcquireStep::Wait { rx, .. } => rx,
            _ => panic!("pool is saturated, expected a waiter"),
        };

        let (outcome, _) = q.release(a.id, Dummy(a.id), a.created_at_ms, 1, false, None);
        assert!(matches!(outcome, ReleaseOutcome::HandedOff));

        let handed = rx.try_recv().expect("waiter should have received the handed-off session");

        // Reclaiming by id must be visible through the handed-off slot's
        // own clone of the flag, not just the busy marker's.
        q.close_busy_connections(0, 1);
        assert!(handed.reclaimed.load(Ordering::SeqCst));
    }

    #[test]
    fn force_closing_the_only_session_regrows_for_a_stranded_waiter() {
        let q = SessionQueue::new(0, 1, 1);
        let a = borrow_one(&q);

        let mut rx = match q.begin_acquire(0) {
            AcquireStep::Wait { rx, .. } => rx,
            _ => panic!("pool is saturated, expected a waiter"),
        };

        let (outcome, _) = q.release(a.id, Dummy(a.id), a.created_at_ms, 1, true, None);
        let (destroyed_session, permit, waiter_tx) = match outcome {
            ReleaseOutcome::DestroyedAndRegrow {
                destroyed,
                permit,
                waiter_tx,
            } => (destroyed, permit, waiter_tx),
            _ => panic!("expected the destroy path to reserve a growth slot for the stranded waiter"),
        };
        assert_eq!(destroyed_session.0, a.id);
        assert_eq!(q.counts(), (1, 1));

        // The caller (outside the lock) opens the replacement and delivers
        // it straight to the waiter instead of leaving it parked.
        let new_id = permit.id;
        assert!(q
            .commit_growth_for_waiter(permit, waiter_tx, Dummy(new_id), 2, 2)
            .is_none());

        let handed = rx.try_recv().expect("stranded waiter should have received the replacement session");
        assert_eq!(handed.id, new_id);
        assert_eq!(q.counts(), (2, 1));
    }
}
