//! The alert sink capability interface.
//!
//! Textured after sqlx-core's `pool::metrics::PoolMetricsObserver`: a small
//! trait with no-op default methods, plus blanket impls so call sites never
//! need to special-case "no observer configured".

use std::ops::Deref;
use std::sync::Arc;

/// Notified of pool-level backend-health and capacity events.
///
/// All three methods default to no-ops so an implementor only overrides the
/// ones it cares about.
pub trait AlertSink: Send + Sync {
    /// The backend transitioned `UP → DOWN`. Invoked at most once per edge.
    fn on_down(&self, pool_name: &str) {
        let _ = pool_name;
    }

    /// The backend transitioned `DOWN → UP`. Invoked at most once per edge.
    fn on_up(&self, pool_name: &str) {
        let _ = pool_name;
    }

    /// `busy` crossed the warning-size threshold. Latched by `inWarning`
    /// until `reset()` clears it.
    fn on_warning(&self, subject: &str, message: &str) {
        let _ = (subject, message);
    }
}

/// No-op sink used when the pool is constructed without one.
#[derive(Default)]
pub struct NoopAlertSink;

impl AlertSink for NoopAlertSink {}

impl<T> AlertSink for Arc<T>
where
    T: AlertSink + ?Sized,
{
    fn on_down(&self, pool_name: &str) {
        self.deref().on_down(pool_name)
    }

    fn on_up(&self, pool_name: &str) {
        self.deref().on_up(pool_name)
    }

    fn on_warning(&self, subject: &str, message: &str) {
        self.deref().on_warning(subject, message)
    }
}
