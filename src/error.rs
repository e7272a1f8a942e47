//! Error and Result types for the pool engine.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for `connpool`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A point-in-time snapshot of busy sessions, attached to [`Error::PoolTimeout`]
/// so callers can diagnose leaks without a second round-trip into the pool.
#[derive(Debug, Clone)]
pub struct BusySnapshot {
    pub free: usize,
    pub busy: usize,
    pub waiting: usize,
    pub max_size: u32,
    pub sessions: Vec<BusySessionInfo>,
}

/// One entry of a [`BusySnapshot`].
#[derive(Debug, Clone)]
pub struct BusySessionInfo {
    pub id: u64,
    pub last_used_at_ms: u64,
    pub borrow_stack: Option<String>,
}

impl fmt::Display for BusySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free={} busy={} waiting={} max={}",
            self.free, self.busy, self.waiting, self.max_size
        )
    }
}

/// A generic error that represents all the ways the pool engine can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing credentials or nonsensical pool limits, raised at construction.
    #[error("invalid pool configuration: {0}")]
    ConfigInvalid(String),

    /// Opening a session or probing the backend failed; the pool has transitioned to `DOWN`.
    #[error("backend is down: {source}")]
    BackendDown {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A waiter's deadline elapsed before a session became available.
    #[error("timed out after {waited:?} waiting for a session ({snapshot})")]
    PoolTimeout {
        waited: Duration,
        snapshot: BusySnapshot,
    },

    /// `borrow` was called after `shutdown` began.
    #[error("pool is closed")]
    PoolClosed,

    /// The facade declined to perform an operation (e.g. log-writer manipulation).
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// A borrowed session failed validation and was force-closed.
    #[error("session failed validation: {source}")]
    SessionInvalid {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub fn backend_down(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::BackendDown {
            source: Box::new(source),
        }
    }

    pub fn session_invalid(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::SessionInvalid {
            source: Box::new(source),
        }
    }
}
