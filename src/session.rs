//! The external collaborators the pool engine delegates to: a session
//! factory that establishes the underlying transport, and the minimal
//! session surface the engine needs for liveness probing and teardown.
//!
//! The wire protocol itself — and everything a caller does with a borrowed
//! session in between `borrow()` and `close()` — is out of scope here.

use std::collections::HashMap;
use std::time::Duration;

use futures_core::future::BoxFuture;

use crate::config::IsolationLevel;
use crate::error::Result;

/// Credentials and connection properties used to open one session.
///
/// Produced by the pool from its [`PoolConfig`][crate::config::PoolConfig],
/// or overridden wholesale for [`Pool::borrow_with`][crate::pool::Pool::borrow_with].
#[derive(Debug, Clone)]
pub struct Credentials {
    pub url: String,
    pub username: String,
    pub password: String,
    pub properties: HashMap<String, String>,
    pub isolation_level: Option<IsolationLevel>,
    pub auto_commit: bool,
}

/// A live, authenticated transport to the database backend.
///
/// Implementors own the wire protocol; the pool only ever calls the three
/// methods below, and only when it is not holding its queue lock.
pub trait Session: Send + 'static {
    /// Vendor-level liveness check (e.g. a lightweight ping), used by the
    /// health monitor when no probe SQL is configured.
    fn is_valid(&mut self, timeout: Duration) -> BoxFuture<'_, bool>;

    /// Execute a probe statement with a per-statement timeout and commit.
    fn execute(&mut self, sql: &str, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    /// Tear down the underlying transport. Best-effort; errors are logged
    /// by the caller, never propagated back to a borrower.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Establishes new [`Session`]s on behalf of the pool.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    /// Produce an authenticated session with the configured autocommit and
    /// isolation level applied.
    fn open<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Self::Session>>;
}
