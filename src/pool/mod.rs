//! The pool engine: queue, health monitor, borrower handle, statement
//! cache, and the `Pool` facade that ties them together.

mod health;
mod inner;
mod queue;
mod session;
mod stmt_cache;

pub use inner::{Pool, PoolBuilder, PoolStatistics};
pub use queue::PoolStatus;
pub use session::PooledSession;
pub use stmt_cache::{CacheKey, StatementCache};
