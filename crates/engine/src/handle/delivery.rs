//! Notification rounds
//!
//! A round walks the handle's subscriptions in registration order and hands
//! each callback the result its notifier computed for the pinned version.
//! The subscription list is captured when the round starts; callbacks added
//! during a round wait for the next one, removed ones are skipped.

use std::sync::Arc;

use strata_core::{Query, StrataError, StrataResult};
use tracing::{debug, trace, warn};

use super::{Handle, Subscription};
use crate::notifier::{Callback, Notifier, NotifierStatus};
use crate::token::NotificationToken;

/// Where this handle's notifiers stand, taken together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// No notifier has anything to wait for
    NoNotifiers,
    /// Some notifier has not caught up with the others
    Pending,
    /// Every notifier is ready for this transaction
    Ready(u64),
}

impl Handle {
    // =========================================================================
    // Readiness
    // =========================================================================

    pub(crate) fn readiness(&self) -> Readiness {
        let notifiers: Vec<Arc<Notifier>> = self.state.lock().notifiers.values().cloned().collect();
        let mut ready = None;
        for notifier in &notifiers {
            match notifier.status() {
                NotifierStatus::Idle | NotifierStatus::Errored => {}
                NotifierStatus::Pending => return Readiness::Pending,
                NotifierStatus::Ready(version) => match ready {
                    Some(seen) if seen != version => return Readiness::Pending,
                    _ => ready = Some(version),
                },
            }
        }
        ready.map_or(Readiness::NoNotifiers, Readiness::Ready)
    }

    fn is_ready_for(&self, target: u64) -> bool {
        if self.is_closed() {
            return true;
        }
        match self.readiness() {
            Readiness::NoNotifiers => true,
            Readiness::Pending => false,
            Readiness::Ready(version) => version >= target,
        }
    }

    /// Block until every notifier of this handle is ready for `target`
    pub(crate) fn wait_for_notifiers(&self, target: u64) {
        trace!(target: "strata::handle", handle = self.id, version = target, "Waiting for notifiers");
        self.coordinator
            .wait_for_notifiers(|| self.is_ready_for(target));
    }

    fn has_callbacks(&self) -> bool {
        !self.state.lock().subscriptions.is_empty()
    }

    fn sends_hooks(&self) -> bool {
        self.config.options.notify_without_subscribers || self.has_callbacks()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Deliver results for `version`, then again if a callback moved the pin
    ///
    /// With no version only latched errors are delivered.
    pub(crate) fn deliver(&self, version: Option<u64>) {
        let outermost = self.state.lock().delivering == 0;
        let mut version = version;
        loop {
            self.deliver_round(version);
            if !outermost {
                return;
            }
            let pinned = {
                let state = self.state.lock();
                if state.closed || state.write.is_some() {
                    return;
                }
                state
                    .pinned
                    .as_ref()
                    .map(|s| s.version().transaction_sequence)
            };
            if pinned.is_none() || pinned == version {
                return;
            }
            version = pinned;
        }
    }

    fn deliver_round(&self, version: Option<u64>) {
        let subscriptions: Vec<(Arc<Notifier>, u64)> = self
            .state
            .lock()
            .subscriptions
            .iter()
            .map(|s| (Arc::clone(&s.notifier), s.token))
            .collect();

        for (notifier, token) in &subscriptions {
            if self.is_closed() {
                break;
            }
            let Some(delivery) = notifier.take_delivery(*token, version) else {
                continue;
            };
            let _delivering = self.enter_delivery();
            let callback = delivery.callback.try_lock();
            match callback {
                Some(mut callback) => {
                    let callback: &mut Callback = &mut callback;
                    callback(&delivery.changes, delivery.error.as_ref());
                }
                None => {
                    debug!(target: "strata::handle", handle = self.id, token, "Callback already running; skipped");
                }
            }
        }
    }

    /// Deliver pending notifications
    ///
    /// With auto-refresh, first advances the read to the version every
    /// notifier is ready for. Without it, reports `changes_available` when a
    /// newer version exists. Does nothing while closed, delivering or writing.
    pub fn notify(&self) {
        {
            let state = self.state.lock();
            if state.closed || state.delivering > 0 || state.write.is_some() {
                return;
            }
        }
        if let Err(e) = self.verify_thread() {
            warn!(target: "strata::handle", handle = self.id, error = %e, "notify() ignored");
            return;
        }

        let binding = self.binding();
        let send_hooks = binding.is_some() && self.sends_hooks();
        if send_hooks {
            if let Some(binding) = &binding {
                binding.will_send_notifications(self);
            }
            if self.is_closed() {
                return;
            }
        }

        let latest = self.storage().latest_version().transaction_sequence;
        let readiness = self.readiness();
        let (pinned, auto_refresh) = {
            let state = self.state.lock();
            (
                state
                    .pinned
                    .as_ref()
                    .map(|s| s.version().transaction_sequence),
                state.auto_refresh,
            )
        };
        if let Some(pinned) = pinned {
            if auto_refresh {
                let target = match readiness {
                    Readiness::Ready(version) => Some(version),
                    Readiness::NoNotifiers => Some(latest),
                    Readiness::Pending => None,
                };
                if let Some(target) = target.filter(|t| *t > pinned) {
                    if let Err(e) = self.advance_read(target) {
                        warn!(target: "strata::handle", handle = self.id, error = %e, "Advancing read failed");
                    }
                }
            } else if latest > pinned {
                if let Some(binding) = &binding {
                    binding.changes_available(self);
                }
            }
        }

        if !self.is_closed() {
            let version = self.pinned_version().or(match readiness {
                Readiness::Ready(version) => Some(version),
                _ => None,
            });
            self.deliver(version);
        }

        if send_hooks && !self.is_closed() {
            if let Some(binding) = &binding {
                binding.did_send_notifications(self);
            }
        }
    }

    /// Advance the read to the newest version and deliver
    ///
    /// Waits until notifiers are ready for the version that was newest when
    /// called. Returns whether the read moved and the handle is still open;
    /// always false while delivering or writing.
    pub fn refresh(&self) -> StrataResult<bool> {
        self.check_open()?;
        {
            let state = self.state.lock();
            if state.delivering > 0 || state.write.is_some() {
                return Ok(false);
            }
        }

        let binding = self.binding();
        let send_hooks = binding.is_some() && self.sends_hooks();
        if send_hooks {
            if let Some(binding) = &binding {
                binding.will_send_notifications(self);
            }
            if self.is_closed() {
                return Ok(false);
            }
        }

        let latest = self.storage().latest_version().transaction_sequence;
        self.wait_for_notifiers(latest);
        let target = match self.readiness() {
            Readiness::Ready(version) if version >= latest => version,
            _ => latest,
        };

        let advanced = match self.pinned_version() {
            None => self.pin_at(target)?,
            Some(pinned) if target > pinned => self.advance_read(target)?,
            Some(_) => false,
        };

        if !self.is_closed() {
            self.deliver(self.pinned_version());
        }
        if send_hooks && !self.is_closed() {
            if let Some(binding) = &binding {
                binding.did_send_notifications(self);
            }
        }
        Ok(advanced && !self.is_closed())
    }

    /// Pin `target` when nothing is pinned, without hooks
    fn pin_at(&self, target: u64) -> StrataResult<bool> {
        let snapshot = self.storage().open_snapshot(target)?;
        let mut state = self.state.lock();
        if state.closed || state.pinned.is_some() {
            return Ok(false);
        }
        self.adopt_snapshot(&mut state, &snapshot);
        self.set_pinned(&mut state, Some(snapshot));
        Ok(true)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register `callback` for changes to `query`
    ///
    /// Callbacks for the same query share one notifier. The first delivery
    /// is the initial, possibly empty, change set.
    pub(crate) fn add_notification_callback(
        &self,
        query: Query,
        callback: Callback,
    ) -> StrataResult<NotificationToken> {
        self.check_open()?;
        let (notifier, token) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StrataError::ClosedHandle);
            }
            let notifier = match state.notifiers.get(&query) {
                Some(notifier) => Arc::clone(notifier),
                None => {
                    let notifier = Arc::new(Notifier::new(
                        self.coordinator.next_id(),
                        self.id,
                        query.clone(),
                    ));
                    self.coordinator.register_notifier(&notifier);
                    state.notifiers.insert(query, Arc::clone(&notifier));
                    notifier
                }
            };
            let token = notifier.add_callback(callback);
            state.subscriptions.push(Subscription {
                notifier: Arc::clone(&notifier),
                token,
            });
            (notifier, token)
        };
        debug!(
            target: "strata::handle",
            handle = self.id,
            notifier = notifier.id(),
            token,
            "Callback registered"
        );
        if self.config.options.automatic_change_notifications {
            self.coordinator.signal_commit();
        }
        Ok(NotificationToken::new(
            self.self_ref.clone(),
            notifier,
            token,
        ))
    }

    /// Remove a callback; the notifier goes once it has none left
    pub(crate) fn remove_notification_callback(&self, notifier: &Arc<Notifier>, token: u64) {
        let removed = notifier.remove_callback(token);
        let detached = {
            let mut state = self.state.lock();
            state
                .subscriptions
                .retain(|s| !(Arc::ptr_eq(&s.notifier, notifier) && s.token == token));
            state
                .pending_suppress
                .retain(|(n, t)| !(Arc::ptr_eq(n, notifier) && *t == token));
            if notifier.callback_count() == 0 {
                let query = notifier.query();
                if state
                    .notifiers
                    .get(query)
                    .is_some_and(|n| Arc::ptr_eq(n, notifier))
                {
                    state.notifiers.remove(query);
                }
                notifier.detach()
            } else {
                Vec::new()
            }
        };
        drop(removed);
        drop(detached);
    }

    /// Exclude the open write from the next delivery to `token`
    pub(crate) fn suppress_next(&self, notifier: &Arc<Notifier>, token: u64) -> StrataResult<()> {
        self.verify_thread()?;
        let mut state = self.state.lock();
        if state.closed || state.write.is_none() {
            return Err(StrataError::invalid_transaction(
                "Suppressing the notification from a write transaction must be done from inside the write transaction.",
            ));
        }
        state.pending_suppress.push((Arc::clone(notifier), token));
        Ok(())
    }
}
