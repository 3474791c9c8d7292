//! Hooks into the embedding application
//!
//! A [`BindingContext`] observes one handle's lifecycle: reads advancing,
//! schema changes, and the start and end of each notification round. Every
//! method has a no-op default, so implementations override only what they
//! need.
//!
//! A [`Scheduler`] is how the coordinator asks the application to call
//! [`Handle::notify`](crate::Handle::notify) on the handle's own thread
//! after a background pass.

use strata_core::Schema;

use crate::handle::Handle;

/// Observer of one handle's lifecycle
///
/// Hooks run on the handle's thread with no internal lock held; they may call
/// back into the handle.
pub trait BindingContext: Send + Sync {
    /// The handle's read is about to advance
    fn will_change(&self, _handle: &Handle) {}

    /// The handle's read advanced or the handle committed
    fn did_change(&self, _handle: &Handle, _version_changed: bool) {}

    /// A newer version exists but the handle does not auto-refresh
    fn changes_available(&self, _handle: &Handle) {}

    /// The handle's schema changed
    fn schema_did_change(&self, _handle: &Handle, _schema: &Schema) {}

    /// A notification round is starting
    fn will_send_notifications(&self, _handle: &Handle) {}

    /// A notification round finished with the handle still open
    fn did_send_notifications(&self, _handle: &Handle) {}
}

/// Requests a `notify()` call on a handle's own thread
pub trait Scheduler: Send + Sync {
    /// Called from the coordinator's thread after each pass
    fn schedule_notify(&self);
}
