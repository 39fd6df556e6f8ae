//! Request bodies for each collector endpoint, and the factory that wraps
//! them into ready-to-queue [`ApiRequest`]s.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use super::{ApiRequest, Method, RequestKind};
use crate::config::{CourierConfig, DeviceInfo};
use crate::host::Clock;
use crate::types::{ApiKey, Event, Profile, ProfileKey, RequestId};

pub const PROFILE_PATH: &str = "client/profiles";
pub const PUSH_TOKEN_PATH: &str = "client/push-tokens";
pub const UNREGISTER_PUSH_TOKEN_PATH: &str = "client/push-token-unregister";
pub const EVENT_PATH: &str = "client/events/";

const COMPANY_ID: &str = "company_id";
const VENDOR_FCM: &str = "FCM";

/// Drops nulls, empty strings and empty objects.
fn filtered(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(_, v)| match v {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        })
        .collect()
}

fn wrap(kind: &str, attributes: Map<String, Value>) -> Value {
    json!({
        "data": {
            "type": kind,
            "attributes": attributes,
        }
    })
}

/// The `attributes` object of a profile body.
///
/// Identifiers and personal keys sit at the top level, location keys under
/// `location`, everything else under `properties`.
pub fn profile_attributes(profile: &Profile) -> Map<String, Value> {
    let mut attributes = Map::new();
    let identifiers = [
        (ProfileKey::Email, &profile.email),
        (ProfileKey::PhoneNumber, &profile.phone_number),
        (ProfileKey::ExternalId, &profile.external_id),
        (ProfileKey::AnonymousId, &profile.anonymous_id),
    ];
    for (key, value) in identifiers {
        if let Some(value) = value {
            attributes.insert(key.as_str().to_string(), Value::String(value.clone()));
        }
    }

    let mut location = Map::new();
    let mut properties = Map::new();
    for (name, value) in &profile.attributes {
        let key = ProfileKey::from_name(name);
        if ProfileKey::PERSONAL.contains(&key) {
            attributes.insert(name.clone(), value.clone());
        } else if ProfileKey::LOCATION.contains(&key) {
            location.insert(name.clone(), value.clone());
        } else if !key.is_identifier() {
            properties.insert(name.clone(), value.clone());
        }
    }

    attributes.insert("location".to_string(), Value::Object(filtered(location)));
    attributes.insert("properties".to_string(), Value::Object(filtered(properties)));
    filtered(attributes)
}

/// `{"data":{"type":"profile","attributes":{...}}}`
pub fn profile_body(profile: &Profile) -> Value {
    wrap("profile", profile_attributes(profile))
}

pub fn push_token_body(token: &str, profile: &Profile, device: &DeviceInfo) -> Value {
    let mut attributes = Map::new();
    attributes.insert("token".into(), token.into());
    attributes.insert("platform".into(), device.platform.clone().into());
    attributes.insert("vendor".into(), VENDOR_FCM.into());
    attributes.insert(
        "enablement_status".into(),
        if device.notifications_enabled {
            "AUTHORIZED"
        } else {
            "UNAUTHORIZED"
        }
        .into(),
    );
    attributes.insert(
        "background".into(),
        if device.background_available {
            "AVAILABLE"
        } else {
            "UNAVAILABLE"
        }
        .into(),
    );
    attributes.insert("profile".into(), profile_body(profile));
    wrap("push-token", filtered(attributes))
}

pub fn unregister_body(token: &str, profile: &Profile, device: &DeviceInfo) -> Value {
    let mut attributes = Map::new();
    attributes.insert("profile".into(), profile_body(profile));
    attributes.insert("token".into(), token.into());
    attributes.insert("platform".into(), device.platform.clone().into());
    attributes.insert("vendor".into(), VENDOR_FCM.into());
    wrap("push-token-unregister", filtered(attributes))
}

/// Event body. `unique_id` is the request id so retried deliveries dedup.
pub fn event_body(
    event: &Event,
    profile: &Profile,
    queued_at: DateTime<Utc>,
    id: RequestId,
) -> Value {
    let mut identifiers = Map::new();
    let special = [
        ("$email", &profile.email),
        ("$phone_number", &profile.phone_number),
        ("$id", &profile.external_id),
        ("$anonymous", &profile.anonymous_id),
    ];
    for (key, value) in special {
        if let Some(value) = value {
            identifiers.insert(key.to_string(), Value::String(value.clone()));
        }
    }

    let mut attributes = Map::new();
    attributes.insert("profile".into(), Value::Object(filtered(identifiers)));
    attributes.insert("metric".into(), json!({ "name": event.metric }));
    if let Some(value) = event.value {
        attributes.insert("value".into(), json!(value));
    }
    attributes.insert(
        "time".into(),
        queued_at.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
    );
    attributes.insert("unique_id".into(), id.to_string().into());

    let mut attributes = filtered(attributes);
    // Kept even when empty.
    attributes.insert(
        "properties".into(),
        Value::Object(event.properties.clone()),
    );
    wrap("event", attributes)
}

/// Builds fully-addressed requests: path, default headers, account query.
#[derive(Clone)]
pub struct RequestFactory {
    config: Arc<CourierConfig>,
    clock: Arc<dyn Clock>,
}

impl RequestFactory {
    pub fn new(config: Arc<CourierConfig>, clock: Arc<dyn Clock>) -> Self {
        RequestFactory { config, clock }
    }

    fn base(&self, kind: RequestKind, path: &str, api_key: &ApiKey) -> ApiRequest {
        ApiRequest::new(kind, path, Method::Post, self.clock.now())
            .with_header("Content-Type", "application/json")
            .with_header("Accept", "application/json")
            .with_header("Revision", self.config.api_revision.clone())
            .with_header("User-Agent", self.config.user_agent.clone())
            .with_header("X-Klaviyo-Mobile", "1")
            .with_query(COMPANY_ID, api_key.as_str())
    }

    pub fn profile(&self, api_key: &ApiKey, profile: &Profile) -> ApiRequest {
        self.base(RequestKind::Profile, PROFILE_PATH, api_key)
            .with_body(profile_body(profile))
    }

    pub fn push_token(&self, api_key: &ApiKey, token: &str, profile: &Profile) -> ApiRequest {
        self.base(RequestKind::PushToken, PUSH_TOKEN_PATH, api_key)
            .with_body(push_token_body(token, profile, &self.config.device))
    }

    /// Addressed to `old_key`, the account the token is leaving.
    pub fn unregister_push_token(
        &self,
        old_key: &ApiKey,
        token: &str,
        profile: &Profile,
    ) -> ApiRequest {
        self.base(
            RequestKind::UnregisterPushToken,
            UNREGISTER_PUSH_TOKEN_PATH,
            old_key,
        )
        .with_body(unregister_body(token, profile, &self.config.device))
    }

    pub fn event(&self, api_key: &ApiKey, event: &Event, profile: &Profile) -> ApiRequest {
        let request = self.base(RequestKind::Event, EVENT_PATH, api_key);
        let body = event_body(event, profile, request.queued_at, request.id);
        request.with_body(body)
    }
}

impl std::fmt::Debug for RequestFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFactory")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ManualClock;
    use chrono::TimeZone;

    fn factory() -> RequestFactory {
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        RequestFactory::new(Arc::new(CourierConfig::new("Xr5bFG")), Arc::new(clock))
    }

    // ─── Profile ───

    #[test]
    fn profile_body_groups_attributes() {
        let profile = Profile::new()
            .with_email("ada@example.com")
            .with_anonymous_id("anon-1")
            .with_attribute(ProfileKey::FirstName, "Ada")
            .with_attribute(ProfileKey::City, "London")
            .with_attribute(ProfileKey::Custom("plan".into()), "gold");

        let body = profile_body(&profile);

        assert_eq!(
            body,
            json!({
                "data": {
                    "type": "profile",
                    "attributes": {
                        "email": "ada@example.com",
                        "anonymous_id": "anon-1",
                        "first_name": "Ada",
                        "location": {"city": "London"},
                        "properties": {"plan": "gold"}
                    }
                }
            })
        );
    }

    #[test]
    fn profile_body_filters_empty_values() {
        let profile = Profile::new()
            .with_email("")
            .with_anonymous_id("anon-1")
            .with_attribute(ProfileKey::LastName, Value::Null);

        let attributes = &profile_body(&profile)["data"]["attributes"];

        assert_eq!(attributes, &json!({"anonymous_id": "anon-1"}));
    }

    // ─── Push tokens ───

    #[test]
    fn push_token_body_embeds_profile_and_device() {
        let device = DeviceInfo {
            platform: "android".into(),
            notifications_enabled: false,
            background_available: true,
        };
        let profile = Profile::new().with_anonymous_id("anon-1");

        let body = push_token_body("tok", &profile, &device);
        let attributes = &body["data"]["attributes"];

        assert_eq!(body["data"]["type"], "push-token");
        assert_eq!(attributes["token"], "tok");
        assert_eq!(attributes["vendor"], "FCM");
        assert_eq!(attributes["platform"], "android");
        assert_eq!(attributes["enablement_status"], "UNAUTHORIZED");
        assert_eq!(attributes["background"], "AVAILABLE");
        assert_eq!(
            attributes["profile"]["data"]["attributes"]["anonymous_id"],
            "anon-1"
        );
    }

    #[test]
    fn unregister_is_addressed_to_old_key() {
        let request = factory().unregister_push_token(
            &ApiKey::new("OldKey"),
            "tok",
            &Profile::new().with_anonymous_id("anon-1"),
        );

        assert_eq!(request.kind, RequestKind::UnregisterPushToken);
        assert_eq!(request.path, UNREGISTER_PUSH_TOKEN_PATH);
        assert_eq!(request.query[COMPANY_ID], "OldKey");
        assert_eq!(
            request.body.as_ref().unwrap()["data"]["type"],
            "push-token-unregister"
        );
    }

    // ─── Events ───

    #[test]
    fn event_body_uses_special_identifier_keys() {
        let request = factory().event(
            &ApiKey::new("Xr5bFG"),
            &Event::new("Opened App").with_value(1.5),
            &Profile::new()
                .with_email("ada@example.com")
                .with_external_id("42")
                .with_anonymous_id("anon-1"),
        );
        let attributes = &request.body.as_ref().unwrap()["data"]["attributes"];

        assert_eq!(request.path, EVENT_PATH);
        assert_eq!(
            attributes["profile"],
            json!({"$email": "ada@example.com", "$id": "42", "$anonymous": "anon-1"})
        );
        assert_eq!(attributes["metric"]["name"], "Opened App");
        assert_eq!(attributes["value"], 1.5);
        assert_eq!(attributes["time"], "2024-03-01T12:00:00Z");
        assert_eq!(attributes["unique_id"], request.id.to_string());
        assert_eq!(attributes["properties"], json!({}));
    }

    #[test]
    fn factory_sets_default_headers_and_query() {
        let request = factory().profile(&ApiKey::new("Xr5bFG"), &Profile::new());

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.headers["Content-Type"], "application/json");
        assert_eq!(request.headers["Revision"], "2023-07-15");
        assert_eq!(request.headers["X-Klaviyo-Mobile"], "1");
        assert!(request.headers["User-Agent"].starts_with("analytics-courier/"));
        assert_eq!(request.query[COMPANY_ID], "Xr5bFG");
    }
}
