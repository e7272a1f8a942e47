//! The pool listener capability interface.

use std::ops::Deref;
use std::sync::Arc;

/// Per-borrow observation hooks, invoked synchronously on the borrow/return
/// path but always outside the queue lock.
pub trait PoolListener: Send + Sync {
    /// Runs after a session is borrowed, before it is handed to the caller.
    fn after_borrow(&self, session_id: u64) {
        let _ = session_id;
    }

    /// Runs before a session is returned to the free list. Not called on
    /// force-close returns.
    fn before_return(&self, session_id: u64) {
        let _ = session_id;
    }
}

/// No-op listener used when the pool is constructed without one.
#[derive(Default)]
pub struct NoopPoolListener;

impl PoolListener for NoopPoolListener {}

impl<T> PoolListener for Arc<T>
where
    T: PoolListener + ?Sized,
{
    fn after_borrow(&self, session_id: u64) {
        self.deref().after_borrow(session_id)
    }

    fn before_return(&self, session_id: u64) {
        self.deref().before_return(session_id)
    }
}
