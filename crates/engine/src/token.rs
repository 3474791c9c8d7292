//! Notification registration tokens

use std::sync::{Arc, Weak};

use strata_core::{StrataError, StrataResult};

use crate::handle::Handle;
use crate::notifier::Notifier;

struct Registration {
    handle: Weak<Handle>,
    notifier: Arc<Notifier>,
    token: u64,
}

/// Keeps a notification callback registered
///
/// Dropping the token removes the callback. A default token is empty and
/// does nothing.
#[derive(Default)]
pub struct NotificationToken {
    registration: Option<Registration>,
}

impl NotificationToken {
    pub(crate) fn new(handle: Weak<Handle>, notifier: Arc<Notifier>, token: u64) -> Self {
        NotificationToken {
            registration: Some(Registration {
                handle,
                notifier,
                token,
            }),
        }
    }

    /// Whether the token refers to no callback
    pub fn is_empty(&self) -> bool {
        self.registration.is_none()
    }

    /// Leave the commit of the handle's current write out of the next
    /// delivery to this callback
    ///
    /// Must be called inside a write transaction on the owning handle.
    pub fn suppress_next(&self) -> StrataResult<()> {
        let registration = self.registration.as_ref().ok_or_else(|| {
            StrataError::invalid_transaction("The notification token is not registered")
        })?;
        let handle = registration.handle.upgrade().ok_or_else(|| {
            StrataError::invalid_transaction("The handle of this notification token is gone")
        })?;
        handle.suppress_next(&registration.notifier, registration.token)
    }

    /// Remove the callback now instead of on drop
    pub fn unregister(&mut self) {
        let Some(registration) = self.registration.take() else {
            return;
        };
        match registration.handle.upgrade() {
            Some(handle) => {
                handle.remove_notification_callback(&registration.notifier, registration.token)
            }
            None => {
                let removed = registration.notifier.remove_callback(registration.token);
                drop(removed);
            }
        }
    }
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.registration {
            Some(r) => f
                .debug_struct("NotificationToken")
                .field("notifier", &r.notifier.id())
                .field("token", &r.token)
                .finish(),
            None => f.write_str("NotificationToken(empty)"),
        }
    }
}
