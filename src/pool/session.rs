//! The borrower-facing handle.
//!
//! `PooledSession<F>` is the only thing that ever holds the live
//! `F::Session`; the queue's `busy` bookkeeping (see `pool/queue.rs`) holds
//! only a lightweight marker plus a shared `reclaimed` flag, so the pool can
//! force-close a leaked borrow's accounting without touching the session
//! itself or waiting on the borrower — mirroring the split sqlx-core draws
//! between `pool::connection::Live<C>`/`Idle<C>` (no back-reference to the
//! pool) and `PoolConnection<C>` (the only owner of a strong `Arc` back to
//! it).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::pool::inner::PoolInner;
use crate::pool::stmt_cache::{CacheKey, StatementCache};
use crate::session::{Session, SessionFactory};

enum Backing<F: SessionFactory> {
    /// Owned by the free/busy bookkeeping of `pool`; returned on drop.
    Pooled {
        id: u64,
        pool: Arc<PoolInner<F>>,
        reclaimed: Arc<AtomicBool>,
    },
    /// Produced by `borrow(user, password)`; never touches the queue.
    /// Closing it tears down the transport directly.
    Standalone,
}

/// An exclusively-owned session handle. Returned to the free list on
/// `Drop` unless [`PooledSession::mark_broken`] was called, the borrow was
/// reclaimed as a leak while still checked out, or the handle is
/// [standalone][`Backing::Standalone`].
pub struct PooledSession<F: SessionFactory> {
    id: u64,
    session: Option<F::Session>,
    created_at_ms: u64,
    borrowed_at: Instant,
    backing: Backing<F>,
    force_close: bool,
    stmt_cache: StatementCache<Box<dyn std::any::Any + Send>>,
}

impl<F: SessionFactory> PooledSession<F> {
    pub(crate) fn new_pooled(
        id: u64,
        session: F::Session,
        created_at_ms: u64,
        pool: Arc<PoolInner<F>>,
        reclaimed: Arc<AtomicBool>,
        stmt_cache_size: usize,
    ) -> Self {
        Self {
            id,
            session: Some(session),
            created_at_ms,
            borrowed_at: Instant::now(),
            backing: Backing::Pooled { id, pool, reclaimed },
            force_close: false,
            stmt_cache: StatementCache::new(stmt_cache_size),
        }
    }

    pub(crate) fn new_standalone(id: u64, session: F::Session, created_at_ms: u64, stmt_cache_size: usize) -> Self {
        Self {
            id,
            session: Some(session),
            created_at_ms,
            borrowed_at: Instant::now(),
            backing: Backing::Standalone,
            force_close: false,
            stmt_cache: StatementCache::new(stmt_cache_size),
        }
    }

    /// The pool-internal identifier, stable for the lifetime of the
    /// underlying session. Useful for correlating with diagnostics from
    /// [`Pool::dump_busy_information`][crate::pool::Pool::dump_busy_information].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Borrow the underlying transport for vendor-specific work. The wire
    /// protocol itself is out of scope here; this exists so a caller can
    /// drive its own query/execute API on top.
    pub fn get_mut(&mut self) -> &mut F::Session {
        self.session
            .as_mut()
            .expect("session is only taken on drop or explicit close")
    }

    /// Mark this session for destruction instead of returning it to the
    /// free list, e.g. after observing a connection-fatal error mid-use.
    /// Has no effect on a standalone (unpooled) session, which is always
    /// destroyed on close.
    pub fn mark_broken(&mut self) {
        self.force_close = true;
    }

    /// Looks up a previously cached prepared-statement artifact for `sql`
    /// under `context`. `context` should include any mutable per-session
    /// state (e.g. the active schema) that would make a cached statement
    /// invalid if ignored.
    pub fn cached_statement(&mut self, sql: &str, context: &str) -> Option<&(dyn std::any::Any + Send)> {
        self.stmt_cache.get(&CacheKey::new(sql, context)).map(AsRef::as_ref)
    }

    /// Caches a prepared-statement artifact under `(sql, context)`.
    pub fn cache_statement(&mut self, sql: impl Into<String>, context: impl Into<String>, statement: Box<dyn std::any::Any + Send>) {
        self.stmt_cache.insert(CacheKey::new(sql, context), statement);
    }

    /// Returns the session to the pool (or tears it down, if standalone),
    /// awaiting any resulting teardown. Prefer this over letting the handle
    /// drop when already in an async context, since `Drop` must spawn a
    /// detached task to do the same work.
    pub async fn close(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let held = self.borrowed_at.elapsed();
        match &self.backing {
            Backing::Standalone => {
                Box::new(session).close().await;
            }
            Backing::Pooled { id, pool, reclaimed } => {
                if reclaimed.load(Ordering::SeqCst) {
                    // Leak reclamation already removed this id from `busy`
                    // and counted it as destroyed; just tear down the
                    // transport, same as the `Drop` path.
                    Box::new(session).close().await;
                    return;
                }
                Arc::clone(pool)
                    .finish_return(*id, session, self.created_at_ms, held, self.force_close)
                    .await;
            }
        }
    }
}

impl<F: SessionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        match &self.backing {
            Backing::Standalone => {
                tokio::spawn(async move {
                    Box::new(session).close().await;
                });
            }
            Backing::Pooled { id, pool, reclaimed } => {
                if reclaimed.load(Ordering::SeqCst) {
                    // Leak reclamation already removed this id from `busy`
                    // and counted it as destroyed; just tear down the
                    // transport.
                    tokio::spawn(async move {
                        Box::new(session).close().await;
                    });
                    return;
                }

                let pool = Arc::clone(pool);
                let id = *id;
                let created_at_ms = self.created_at_ms;
                let held = self.borrowed_at.elapsed();
                let force_close = self.force_close;
                tokio::spawn(async move {
                    pool.finish_return(id, session, created_at_ms, held, force_close).await;
                });
            }
        }
    }
}
