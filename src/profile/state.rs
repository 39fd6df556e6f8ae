//! The authoritative, persisted profile.
//!
//! Every field lives under its own store key and is loaded lazily. Setters
//! broadcast a [`StateChange`] when (and only when) the value actually
//! changed; the coalescer turns those into outbound requests.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::persistent::{GeneratedIdCodec, ObjectCodec, PersistentProperty, TextCodec};
use crate::observers::{Listener, ObserverHandle, ObserverRegistry};
use crate::store::{DataStore, StoreChange};
use crate::types::{ApiKey, Profile, ProfileKey};

pub const API_KEY_KEY: &str = "api_key";
pub const EXTERNAL_ID_KEY: &str = "external_id";
pub const EMAIL_KEY: &str = "email";
pub const PHONE_NUMBER_KEY: &str = "phone_number";
pub const ANONYMOUS_ID_KEY: &str = "anonymous_id";
pub const ATTRIBUTES_KEY: &str = "attributes";
pub const PUSH_TOKEN_KEY: &str = "push_token";

/// Which part of the state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    ApiKey,
    ExternalId,
    Email,
    PhoneNumber,
    AnonymousId,
    Attributes,
    PushToken,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::ApiKey => API_KEY_KEY,
            StateKey::ExternalId => EXTERNAL_ID_KEY,
            StateKey::Email => EMAIL_KEY,
            StateKey::PhoneNumber => PHONE_NUMBER_KEY,
            StateKey::AnonymousId => ANONYMOUS_ID_KEY,
            StateKey::Attributes => ATTRIBUTES_KEY,
            StateKey::PushToken => PUSH_TOKEN_KEY,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast after a state mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// `None` after a full [`ProfileState::reset`].
    pub key: Option<StateKey>,
    /// The previous value in its stored form, if there was one.
    pub old_value: Option<String>,
}

/// Persisted identifiers, attributes, API key and push token.
pub struct ProfileState {
    api_key: PersistentProperty<TextCodec>,
    external_id: PersistentProperty<TextCodec>,
    email: PersistentProperty<TextCodec>,
    phone_number: PersistentProperty<TextCodec>,
    anonymous_id: PersistentProperty<GeneratedIdCodec>,
    attributes: PersistentProperty<ObjectCodec>,
    push_token: PersistentProperty<TextCodec>,

    store: Arc<dyn DataStore>,
    store_handle: Mutex<Option<ObserverHandle>>,
    observers: ObserverRegistry<StateChange>,
}

impl ProfileState {
    /// Creates the state over `store`.
    ///
    /// Writes to our keys made by anyone else drop the cached value, so the
    /// next read sees the store.
    pub fn new(store: Arc<dyn DataStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ProfileState>| {
            let weak = weak.clone();
            let handle = store.on_store_change(Box::new(move |change: &StoreChange| {
                if let Some(state) = weak.upgrade() {
                    state.on_store_change(change);
                }
            }));
            ProfileState {
                api_key: PersistentProperty::new(API_KEY_KEY, TextCodec, store.clone()),
                external_id: PersistentProperty::new(EXTERNAL_ID_KEY, TextCodec, store.clone()),
                email: PersistentProperty::new(EMAIL_KEY, TextCodec, store.clone()),
                phone_number: PersistentProperty::new(PHONE_NUMBER_KEY, TextCodec, store.clone()),
                anonymous_id: PersistentProperty::new(
                    ANONYMOUS_ID_KEY,
                    GeneratedIdCodec,
                    store.clone(),
                ),
                attributes: PersistentProperty::new(ATTRIBUTES_KEY, ObjectCodec, store.clone()),
                push_token: PersistentProperty::new(PUSH_TOKEN_KEY, TextCodec, store.clone()),
                store: store.clone(),
                store_handle: Mutex::new(Some(handle)),
                observers: ObserverRegistry::new(),
            }
        })
    }

    fn on_store_change(&self, change: &StoreChange) {
        // Our own writes land here too. They update the cache only after the
        // store write returns, so invalidating here loses nothing.
        match change.key.as_str() {
            API_KEY_KEY => self.api_key.invalidate(),
            EXTERNAL_ID_KEY => self.external_id.invalidate(),
            EMAIL_KEY => self.email.invalidate(),
            PHONE_NUMBER_KEY => self.phone_number.invalidate(),
            ANONYMOUS_ID_KEY => self.anonymous_id.invalidate(),
            ATTRIBUTES_KEY => self.attributes.invalidate(),
            PUSH_TOKEN_KEY => self.push_token.invalidate(),
            _ => {}
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────────

    /// The account key, `None` if never set.
    pub fn api_key(&self) -> Option<ApiKey> {
        Some(self.api_key.get())
            .filter(|k| !k.is_empty())
            .map(ApiKey::from)
    }

    pub fn external_id(&self) -> Option<String> {
        non_empty(self.external_id.get())
    }

    pub fn email(&self) -> Option<String> {
        non_empty(self.email.get())
    }

    pub fn phone_number(&self) -> Option<String> {
        non_empty(self.phone_number.get())
    }

    /// Always set: generated and persisted on first access.
    pub fn anonymous_id(&self) -> String {
        self.anonymous_id.get()
    }

    pub fn push_token(&self) -> Option<String> {
        non_empty(self.push_token.get())
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.attributes.get()
    }

    /// Snapshot of identifiers (anonymous id included) and, optionally,
    /// attributes.
    pub fn as_profile(&self, with_attributes: bool) -> Profile {
        Profile {
            external_id: self.external_id(),
            email: self.email(),
            phone_number: self.phone_number(),
            anonymous_id: Some(self.anonymous_id()),
            attributes: if with_attributes {
                self.attributes()
            } else {
                Map::new()
            },
        }
    }

    // ─── Mutators ────────────────────────────────────────────────────────────────

    pub fn set_api_key(&self, key: impl Into<ApiKey>) {
        let key = key.into();
        self.set_text(&self.api_key, StateKey::ApiKey, key.0);
    }

    pub fn set_external_id(&self, id: impl Into<String>) {
        self.set_text(&self.external_id, StateKey::ExternalId, id.into());
    }

    pub fn set_email(&self, email: impl Into<String>) {
        self.set_text(&self.email, StateKey::Email, email.into());
    }

    pub fn set_phone_number(&self, phone: impl Into<String>) {
        self.set_text(&self.phone_number, StateKey::PhoneNumber, phone.into());
    }

    pub fn set_push_token(&self, token: impl Into<String>) {
        self.set_text(&self.push_token, StateKey::PushToken, token.into());
    }

    /// Sets one attribute. Identifier keys go to their dedicated fields.
    pub fn set_attribute(&self, key: ProfileKey, value: impl Into<Value>) {
        let value = value.into();
        match key {
            ProfileKey::ExternalId => self.set_external_id(stringify(value)),
            ProfileKey::Email => self.set_email(stringify(value)),
            ProfileKey::PhoneNumber => self.set_phone_number(stringify(value)),
            ProfileKey::AnonymousId => {
                warn!("Anonymous ID is generated internally, ignoring attempt to set it");
            }
            other => {
                let old = self.attributes.get();
                let mut updated = old.clone();
                updated.insert(other.as_str().to_string(), value);
                if self.attributes.set(updated) {
                    self.broadcast(StateKey::Attributes, object_string(&old));
                }
            }
        }
    }

    /// Replaces the whole profile.
    ///
    /// If an identified user is current, the state is reset first so the new
    /// profile gets a fresh anonymous id. Identifiers absent from `profile`
    /// are cleared.
    pub fn set_profile(&self, profile: Profile) {
        if self.as_profile(false).has_external_identifier() {
            debug!("Replacing identified profile, resetting state first");
            self.reset();
        }
        self.set_external_id(profile.external_id.unwrap_or_default());
        self.set_email(profile.email.unwrap_or_default());
        self.set_phone_number(profile.phone_number.unwrap_or_default());

        let old = self.attributes.get();
        if self.attributes.set(profile.attributes) {
            self.broadcast(StateKey::Attributes, object_string(&old));
        }
    }

    /// Forgets the user: identifiers, anonymous id and attributes.
    ///
    /// The API key and push token survive. A new anonymous id is generated
    /// on next read.
    pub fn reset(&self) {
        self.external_id.reset();
        self.email.reset();
        self.phone_number.reset();
        self.anonymous_id.reset();
        self.attributes.reset();
        debug!("Profile state reset");
        self.observers.notify(&StateChange {
            key: None,
            old_value: None,
        });
    }

    /// Drops locally held attributes once they have been sent.
    pub fn reset_attributes(&self) {
        let old = self.attributes.get();
        self.attributes.reset();
        self.broadcast(StateKey::Attributes, object_string(&old));
    }

    /// Clears a rejected email without broadcasting.
    pub fn reset_email(&self) {
        self.email.reset();
    }

    /// Clears a rejected phone number without broadcasting.
    pub fn reset_phone_number(&self) {
        self.phone_number.reset();
    }

    // ─── Observers ───────────────────────────────────────────────────────────────

    pub fn on_state_change(&self, listener: Listener<StateChange>) -> ObserverHandle {
        self.observers.register(listener)
    }

    pub fn off_state_change(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }

    fn set_text(&self, property: &PersistentProperty<TextCodec>, key: StateKey, value: String) {
        let old = property.get();
        if property.set(value) {
            self.broadcast(key, non_empty(old));
        }
    }

    fn broadcast(&self, key: StateKey, old_value: Option<String>) {
        debug!(key = %key, "Profile state changed");
        self.observers.notify(&StateChange {
            key: Some(key),
            old_value,
        });
    }
}

impl Drop for ProfileState {
    fn drop(&mut self) {
        if let Some(handle) = self.store_handle.lock().take() {
            self.store.off_store_change(handle);
        }
    }
}

impl fmt::Debug for ProfileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileState")
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

fn non_empty(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

fn object_string(map: &Map<String, Value>) -> Option<String> {
    (!map.is_empty()).then(|| Value::Object(map.clone()).to_string())
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDataStore;
    use serde_json::json;

    fn state() -> (Arc<InMemoryDataStore>, Arc<ProfileState>) {
        let store = Arc::new(InMemoryDataStore::new());
        let state = ProfileState::new(store.clone());
        (store, state)
    }

    fn record(state: &ProfileState) -> Arc<Mutex<Vec<StateChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        state.on_state_change(Box::new(move |c| sink.lock().push(c.clone())));
        seen
    }

    // ─── Identifiers ───

    #[test]
    fn setters_persist_and_broadcast_old_value() {
        let (store, state) = state();
        let seen = record(&state);

        state.set_email("old@example.com");
        state.set_email("new@example.com");

        assert_eq!(state.email().as_deref(), Some("new@example.com"));
        assert_eq!(
            store.fetch(EMAIL_KEY).unwrap().as_deref(),
            Some("new@example.com")
        );
        assert_eq!(
            *seen.lock(),
            vec![
                StateChange {
                    key: Some(StateKey::Email),
                    old_value: None
                },
                StateChange {
                    key: Some(StateKey::Email),
                    old_value: Some("old@example.com".into())
                },
            ]
        );
    }

    #[test]
    fn unchanged_value_does_not_broadcast() {
        let (_, state) = state();
        state.set_external_id("42");
        let seen = record(&state);

        state.set_external_id("42");

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn anonymous_id_is_stable_until_reset() {
        let (store, state) = state();
        let first = state.anonymous_id();
        assert_eq!(state.anonymous_id(), first);

        let reopened = ProfileState::new(store);
        assert_eq!(reopened.anonymous_id(), first);

        reopened.reset();
        assert_ne!(reopened.anonymous_id(), first);
    }

    #[test]
    fn api_key_absent_until_set() {
        let (_, state) = state();
        assert_eq!(state.api_key(), None);
        state.set_api_key("Xr5bFG");
        assert_eq!(state.api_key(), Some(ApiKey::from("Xr5bFG")));
    }

    // ─── Attributes ───

    #[test]
    fn set_attribute_routes_identifiers_and_merges_the_rest() {
        let (_, state) = state();
        state.set_attribute(ProfileKey::Email, "ada@example.com");
        state.set_attribute(ProfileKey::FirstName, "Ada");
        state.set_attribute(ProfileKey::City, "London");

        assert_eq!(state.email().as_deref(), Some("ada@example.com"));
        let attributes = state.attributes();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["first_name"], json!("Ada"));
        assert_eq!(attributes["city"], json!("London"));
    }

    #[test]
    fn anonymous_id_cannot_be_set_as_attribute() {
        let (_, state) = state();
        let id = state.anonymous_id();
        state.set_attribute(ProfileKey::AnonymousId, "forged");
        assert_eq!(state.anonymous_id(), id);
        assert!(state.attributes().is_empty());
    }

    #[test]
    fn as_profile_optionally_includes_attributes() {
        let (_, state) = state();
        state.set_phone_number("+15555550100");
        state.set_attribute(ProfileKey::Title, "Engineer");

        let bare = state.as_profile(false);
        assert_eq!(bare.phone_number.as_deref(), Some("+15555550100"));
        assert_eq!(bare.anonymous_id, Some(state.anonymous_id()));
        assert!(bare.attributes.is_empty());

        let full = state.as_profile(true);
        assert_eq!(full.attributes["title"], json!("Engineer"));
    }

    #[test]
    fn reset_attributes_broadcasts_attributes_key() {
        let (_, state) = state();
        state.set_attribute(ProfileKey::Zip, "02108");
        let seen = record(&state);

        state.reset_attributes();

        assert!(state.attributes().is_empty());
        assert_eq!(seen.lock()[0].key, Some(StateKey::Attributes));
    }

    // ─── Reset ───

    #[test]
    fn reset_keeps_api_key_and_push_token() {
        let (_, state) = state();
        state.set_api_key("Xr5bFG");
        state.set_push_token("tok");
        state.set_email("ada@example.com");
        state.set_attribute(ProfileKey::City, "London");
        let seen = record(&state);

        state.reset();

        assert_eq!(state.email(), None);
        assert!(state.attributes().is_empty());
        assert_eq!(state.api_key(), Some(ApiKey::from("Xr5bFG")));
        assert_eq!(state.push_token().as_deref(), Some("tok"));
        assert_eq!(
            *seen.lock(),
            vec![StateChange {
                key: None,
                old_value: None
            }]
        );
    }

    #[test]
    fn field_resets_are_silent() {
        let (_, state) = state();
        state.set_email("bad@");
        state.set_phone_number("nope");
        let seen = record(&state);

        state.reset_email();
        state.reset_phone_number();

        assert_eq!(state.email(), None);
        assert_eq!(state.phone_number(), None);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn set_profile_resets_identified_user_first() {
        let (_, state) = state();
        state.set_external_id("old-user");
        state.set_attribute(ProfileKey::City, "London");
        let anonymous = state.anonymous_id();

        state.set_profile(
            Profile::new()
                .with_email("new@example.com")
                .with_attribute(ProfileKey::FirstName, "Grace"),
        );

        assert_eq!(state.external_id(), None);
        assert_eq!(state.email().as_deref(), Some("new@example.com"));
        assert_ne!(state.anonymous_id(), anonymous);
        let attributes = state.attributes();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes["first_name"], json!("Grace"));
    }

    #[test]
    fn set_profile_keeps_anonymous_user_id() {
        let (_, state) = state();
        let anonymous = state.anonymous_id();

        state.set_profile(Profile::new().with_external_id("42"));

        assert_eq!(state.anonymous_id(), anonymous);
        assert_eq!(state.external_id().as_deref(), Some("42"));
    }

    // ─── Store ───

    #[test]
    fn external_store_write_is_picked_up() {
        let (store, state) = state();
        assert_eq!(state.push_token(), None);

        store.store(PUSH_TOKEN_KEY, "from-elsewhere").unwrap();

        assert_eq!(state.push_token().as_deref(), Some("from-elsewhere"));
    }
}
