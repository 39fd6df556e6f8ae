//! Debounced conversion of profile state changes into requests.
//!
//! Each identifier or attribute change snapshots the full profile and merges
//! it into one pending update, restarting a short debounce timer. When the
//! timer fires the pending update becomes a single request. A change that
//! arrives with a different anonymous id (the user was reset) flushes the
//! old pending update first, so two identities are never merged.
//!
//! The coalescer also watches request broadcasts: a 400 naming an invalid
//! email or phone number clears just that field.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::state::{ProfileState, StateChange, StateKey};
use crate::client::ApiClient;
use crate::config::CourierConfig;
use crate::host::{Cancellable, Clock};
use crate::observers::ObserverHandle;
use crate::request::{ApiRequest, EMAIL_POINTER, PHONE_NUMBER_POINTER, RequestStatus};
use crate::types::{ApiKey, Profile};

const BAD_REQUEST: u16 = 400;

#[derive(Default)]
struct Pending {
    profile: Option<Profile>,
    timer: Option<Cancellable>,
}

struct Inner {
    state: Arc<ProfileState>,
    client: Arc<dyn ApiClient>,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    pending: Mutex<Pending>,
}

/// Registration of the coalescer on a [`ProfileState`] and an [`ApiClient`].
///
/// Dropping it detaches.
pub struct StateCoalescer {
    inner: Arc<Inner>,
    handles: Mutex<Option<(ObserverHandle, ObserverHandle)>>,
}

impl StateCoalescer {
    /// Starts listening to `state` changes and `client` broadcasts.
    pub fn attach(
        state: Arc<ProfileState>,
        client: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
        config: &CourierConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            state,
            client,
            clock,
            debounce: config.debounce_interval,
            pending: Mutex::new(Pending::default()),
        });

        let weak = Arc::downgrade(&inner);
        let state_handle = inner.state.on_state_change(Box::new(move |change: &StateChange| {
            if let Some(inner) = weak.upgrade() {
                inner.on_state_change(change);
            }
        }));

        let weak = Arc::downgrade(&inner);
        let request_handle = inner.client.on_request_observed(
            Box::new(move |request: &ApiRequest| {
                if let Some(inner) = weak.upgrade() {
                    inner.after_request(request);
                }
            }),
            false,
        );

        debug!(debounce_ms = inner.debounce.as_millis() as u64, "State coalescer attached");
        StateCoalescer {
            inner,
            handles: Mutex::new(Some((state_handle, request_handle))),
        }
    }

    /// Enqueues the pending update now, if there is one.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// True while an update is waiting for its debounce timer.
    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().profile.is_some()
    }

    /// Stops listening and cancels the debounce timer. The pending update,
    /// if any, is discarded.
    pub fn detach(&self) {
        if let Some((state_handle, request_handle)) = self.handles.lock().take() {
            self.inner.state.off_state_change(state_handle);
            self.inner.client.off_request_observed(request_handle);
        }
        let timer = {
            let mut pending = self.inner.pending.lock();
            pending.profile = None;
            pending.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
    }
}

impl Drop for StateCoalescer {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for StateCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCoalescer")
            .field("debounce", &self.inner.debounce)
            .field("pending", &self.has_pending())
            .finish()
    }
}

impl Inner {
    fn on_state_change(self: &Arc<Self>, change: &StateChange) {
        match change.key {
            Some(StateKey::ApiKey) => self.on_api_key_change(change.old_value.as_deref()),
            Some(StateKey::PushToken) => self.on_push_token_change(),
            Some(StateKey::Attributes) if self.state.attributes().is_empty() => {
                trace!("Attributes cleared, nothing to send");
            }
            _ => self.on_user_state_change(),
        }
    }

    /// Moves the push token from the old account to the new one.
    fn on_api_key_change(&self, old_key: Option<&str>) {
        let Some(token) = self.state.push_token() else {
            trace!("API key changed without a push token");
            return;
        };
        let profile = self.state.as_profile(false);
        if let Some(old_key) = old_key.filter(|k| !k.is_empty()) {
            debug!("API key changed, unregistering push token from previous account");
            self.client
                .enqueue_unregister_push_token(&ApiKey::from(old_key), &token, &profile);
        }
        self.client.enqueue_push_token(&token, &profile);
    }

    fn on_push_token_change(&self) {
        if let Some(token) = self.state.push_token() {
            self.client
                .enqueue_push_token(&token, &self.state.as_profile(false));
        }
    }

    fn on_user_state_change(self: &Arc<Self>) {
        let snapshot = self.state.as_profile(true);
        if let Some(stale) = self.absorb(snapshot) {
            debug!("Identity reset, flushing pending update for previous user");
            self.send(stale);
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let timer = self.clock.schedule(
            self.debounce,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            }),
        );
        if let Some(previous) = self.pending.lock().timer.replace(timer) {
            previous.cancel();
        }
    }

    /// Merges `snapshot` into the pending update. A pending update for a
    /// different anonymous id is taken out whole and returned instead of
    /// merged; its timer is cancelled.
    fn absorb(&self, snapshot: Profile) -> Option<Profile> {
        let mut pending = self.pending.lock();
        match pending.profile.take() {
            Some(existing) if existing.anonymous_id != snapshot.anonymous_id => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.profile = Some(snapshot);
                Some(existing)
            }
            Some(existing) => {
                pending.profile = Some(existing.merged(snapshot));
                None
            }
            None => {
                pending.profile = Some(snapshot);
                None
            }
        }
    }

    fn flush(&self) {
        let (profile, timer) = {
            let mut pending = self.pending.lock();
            (pending.profile.take(), pending.timer.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        match profile {
            Some(profile) => self.send(profile),
            None => trace!("Nothing pending to flush"),
        }
    }

    /// Enqueues `profile`, via the push token endpoint when a token is set,
    /// then drops the attributes that went with it.
    fn send(&self, profile: Profile) {
        match self.state.push_token() {
            Some(token) => {
                debug!("Flushing profile update with push token");
                self.client.enqueue_push_token(&token, &profile);
            }
            None => {
                debug!("Flushing profile update");
                self.client.enqueue_profile(&profile);
            }
        }
        self.state.reset_attributes();
    }

    /// Clears a field the collector rejected.
    fn after_request(&self, request: &ApiRequest) {
        if request.status() != RequestStatus::Failed || request.response_code != Some(BAD_REQUEST)
        {
            return;
        }
        let errors = request.error_response().errors;
        let Some(invalid) = errors.iter().find(|e| e.is_invalid_input()) else {
            return;
        };
        match invalid.pointer() {
            Some(EMAIL_POINTER) => {
                self.state.reset_email();
                warn!(request_id = %request.id, "Invalid email - resetting email state");
            }
            Some(PHONE_NUMBER_POINTER) => {
                self.state.reset_phone_number();
                warn!(request_id = %request.id, "Invalid phone number - resetting phone number state");
            }
            _ => warn!(request_id = %request.id, "Input error: {}", invalid.detail),
        }
    }
}
