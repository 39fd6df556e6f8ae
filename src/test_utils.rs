//! Shared test doubles and arbitrary generators for property-based testing.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::observers::{Listener, ObserverHandle, ObserverRegistry};
use crate::request::{ApiRequest, Method, RequestKind};
use crate::transport::{HttpResponse, Transport, TransportError, TransportErrorKind};
use crate::types::{ApiKey, Event, Profile, RequestId};

// ─── Requests ───

/// A fresh `Unsent` event request queued now.
pub fn test_request() -> ApiRequest {
    test_request_at(Utc::now())
}

pub fn test_request_at(queued_at: DateTime<Utc>) -> ApiRequest {
    ApiRequest::new(RequestKind::Event, "client/events/", Method::Post, queued_at)
        .with_query("company_id", "Xr5bFG")
}

// ─── Mock transport ───

/// One scripted outcome of [`MockTransport::execute`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Status(u16),
    WithHeaders(u16, Vec<(String, String)>),
    Body(u16, String),
    /// No response at all, as on a dropped connection.
    Error,
}

type Hook = Box<dyn Fn(&ApiRequest) + Send + Sync>;

/// Transport answering from per-request scripts, 202 once a script runs out.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<RequestId, VecDeque<MockReply>>>,
    sent: Mutex<Vec<ApiRequest>>,
    hook: Mutex<Option<Hook>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues replies for `id`, consumed one per attempt.
    pub fn script(&self, id: RequestId, replies: impl IntoIterator<Item = MockReply>) {
        self.scripts
            .lock()
            .entry(id)
            .or_default()
            .extend(replies);
    }

    /// Runs `hook` on every request as it is executed, before replying.
    pub fn set_hook(&self, hook: impl Fn(&ApiRequest) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Every request executed so far, as it looked when sent.
    pub fn sent(&self) -> Vec<ApiRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_ids(&self) -> Vec<RequestId> {
        self.sent.lock().iter().map(|r| r.id).collect()
    }
}

impl Transport for MockTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<HttpResponse, TransportError> {
        self.sent.lock().push(request.clone());
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(request);
        }

        let reply = self
            .scripts
            .lock()
            .get_mut(&request.id)
            .and_then(|replies| replies.pop_front())
            .unwrap_or(MockReply::Status(202));

        match reply {
            MockReply::Status(status) => Ok(HttpResponse::new(status)),
            MockReply::WithHeaders(status, headers) => Ok(headers
                .into_iter()
                .fold(HttpResponse::new(status), |r, (k, v)| r.with_header(k, v))),
            MockReply::Body(status, body) => Ok(HttpResponse::new(status).with_body(body)),
            MockReply::Error => Err(TransportError::new(
                TransportErrorKind::Connect,
                "connection refused",
            )),
        }
    }
}

// ─── Recording client ───

/// One call made on a [`RecordingClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Profile(Profile),
    PushToken(String, Profile),
    Event(Event, Profile),
    UnregisterPushToken(ApiKey, String, Profile),
    Flush,
}

/// [`ApiClient`] that records calls instead of queueing.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<Recorded>>,
    observers: ObserverRegistry<ApiRequest>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().clone()
    }

    /// Profiles passed to `enqueue_profile`, in order.
    pub fn profiles(&self) -> Vec<Profile> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Recorded::Profile(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivers `request` to subscribers, as the real queue would.
    pub fn emit(&self, request: &ApiRequest) {
        self.observers.notify(request);
    }

    fn record(&self, call: Recorded, kind: RequestKind) -> ApiRequest {
        self.calls.lock().push(call);
        ApiRequest::new(kind, "client/test", Method::Post, Utc::now())
    }
}

impl ApiClient for RecordingClient {
    fn enqueue_profile(&self, profile: &Profile) -> ApiRequest {
        self.record(Recorded::Profile(profile.clone()), RequestKind::Profile)
    }

    fn enqueue_push_token(&self, token: &str, profile: &Profile) -> ApiRequest {
        self.record(
            Recorded::PushToken(token.to_string(), profile.clone()),
            RequestKind::PushToken,
        )
    }

    fn enqueue_event(&self, event: &Event, profile: &Profile) -> ApiRequest {
        self.record(
            Recorded::Event(event.clone(), profile.clone()),
            RequestKind::Event,
        )
    }

    fn enqueue_unregister_push_token(
        &self,
        old_key: &ApiKey,
        token: &str,
        profile: &Profile,
    ) -> ApiRequest {
        self.record(
            Recorded::UnregisterPushToken(old_key.clone(), token.to_string(), profile.clone()),
            RequestKind::UnregisterPushToken,
        )
    }

    fn flush_now(&self) {
        self.calls.lock().push(Recorded::Flush);
    }

    fn on_request_observed(
        &self,
        listener: Listener<ApiRequest>,
        _include_history: bool,
    ) -> ObserverHandle {
        self.observers.register(listener)
    }

    fn off_request_observed(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}

// ─── Strategies ───

pub fn arb_request_id() -> impl Strategy<Value = RequestId> {
    any::<u128>().prop_map(|n| RequestId(Uuid::from_u128(n)))
}

pub fn arb_request_kind() -> impl Strategy<Value = RequestKind> {
    prop_oneof![
        Just(RequestKind::Profile),
        Just(RequestKind::PushToken),
        Just(RequestKind::UnregisterPushToken),
        Just(RequestKind::Event),
        Just(RequestKind::Generic),
    ]
}

pub fn arb_body() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        "[ -~]{0,20}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        Just(Value::Null),
    ];
    prop::collection::btree_map("[a-z_]{1,10}", leaf, 0..5)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
}

pub fn arb_request() -> impl Strategy<Value = ApiRequest> {
    (
        arb_request_id(),
        arb_request_kind(),
        "[a-z][a-z/-]{0,30}",
        prop::collection::btree_map("[A-Za-z-]{1,12}", "[ -~]{0,20}", 0..4),
        prop::collection::btree_map("[a-z_]{1,10}", "[ -~]{0,20}", 0..3),
        prop::option::of(arb_body()),
        0i64..4_000_000_000_000,
    )
        .prop_map(|(id, kind, path, headers, query, body, millis)| {
            let queued_at = DateTime::from_timestamp_millis(millis).unwrap_or_default();
            let mut request = ApiRequest::new(kind, path, Method::Post, queued_at).with_id(id);
            request.headers = headers;
            request.query = query;
            request.body = body;
            request
        })
}
