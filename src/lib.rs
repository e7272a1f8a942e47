//! `connpool`: a database connection-pool engine.
//!
//! Manages a bounded set of reusable sessions to a backend delegated to a
//! [`SessionFactory`](session::SessionFactory): admits or blocks borrowers
//! fairly under load, grows and shrinks the set with idleness and age,
//! detects backend outages via a background health monitor, and reclaims
//! sessions leaked past a configurable threshold.
//!
//! Establishing the underlying session, the wire protocol, configuration
//! *parsing*, and alert/metrics delivery are all external collaborators —
//! see [`session`], [`config`], [`alert`], and [`listener`].

pub mod alert;
pub mod config;
pub mod error;
pub mod listener;
pub mod pool;
pub mod session;

pub use error::{Error, Result};
pub use pool::{Pool, PoolBuilder, PoolStatistics, PoolStatus, PooledSession};
