//! Outbound API requests and their lifecycle.
//!
//! An [`ApiRequest`] is created `Unsent` by a producer, then mutated only by
//! [`ApiRequest::send`] on the scheduler task:
//!
//! ```text
//! Unsent ──► Inflight ──► Complete        (2xx)
//!                    ├──► PendingRetry    (429, attempts remain)
//!                    └──► Failed          (other status, retries exhausted, I/O error)
//! PendingRetry ──► Inflight               (next drain pass)
//! ```
//!
//! `Complete` and `Failed` are terminal. Equality and hashing use the id
//! only, so two requests with the same id are the same request whatever
//! their payload.

mod body;
mod codec;
mod error_response;

pub use body::{
    RequestFactory, event_body, profile_attributes, profile_body, push_token_body,
    unregister_body,
};
pub use codec::{PersistedRequest, RequestDecodeError, decode, encode};
pub use error_response::{
    ApiError, EMAIL_POINTER, ErrorResponse, ErrorSource, INVALID_INPUT_TITLE,
    PHONE_NUMBER_POINTER,
};

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::host::{Clock, NetworkMonitor};
use crate::transport::Transport;
use crate::types::RequestId;

/// Header carrying `<attempt>/<max>` on every send.
pub const ATTEMPT_HEADER: &str = "X-Klaviyo-Attempt-Count";

/// Response header naming how many seconds to wait before retrying.
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// The status code the collector uses for rate limiting.
pub const RATE_LIMITED: u16 = 429;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestStatus {
    #[default]
    Unsent,
    Inflight,
    PendingRetry,
    Complete,
    Failed,
}

impl RequestStatus {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Unsent => write!(f, "unsent"),
            RequestStatus::Inflight => write!(f, "inflight"),
            RequestStatus::PendingRetry => write!(f, "pending_retry"),
            RequestStatus::Complete => write!(f, "complete"),
            RequestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a request does. Persisted as `request_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Profile,
    PushToken,
    UnregisterPushToken,
    Event,
    /// Anything else, including kinds written by newer versions.
    Generic,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Profile => "profile",
            RequestKind::PushToken => "push_token",
            RequestKind::UnregisterPushToken => "unregister_push_token",
            RequestKind::Event => "event",
            RequestKind::Generic => "generic",
        }
    }

    /// Maps a persisted type name back to a kind. Unknown names are `Generic`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "profile" => RequestKind::Profile,
            "push_token" => RequestKind::PushToken,
            "unregister_push_token" => RequestKind::UnregisterPushToken,
            "event" => RequestKind::Event,
            _ => RequestKind::Generic,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Get,
    #[default]
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators needed to perform one send.
pub struct SendContext<'a, T> {
    pub transport: &'a T,
    pub network: &'a dyn NetworkMonitor,
    pub clock: &'a dyn Clock,
    pub max_retries: u32,
}

/// One queued call to the collector.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Path relative to the configured base URL.
    pub path: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Sends performed while connected. Never incremented without connectivity.
    pub attempts: u32,
    status: RequestStatus,
    pub response_code: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
}

impl ApiRequest {
    pub fn new(
        kind: RequestKind,
        path: impl Into<String>,
        method: Method,
        queued_at: DateTime<Utc>,
    ) -> Self {
        ApiRequest {
            id: RequestId::new(),
            kind,
            path: path.into(),
            method,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            queued_at,
            started_at: None,
            ended_at: None,
            attempts: 0,
            status: RequestStatus::Unsent,
            response_code: None,
            response_headers: BTreeMap::new(),
            response_body: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Moves to `status`, stamping start and end times.
    ///
    /// Entering `Inflight` stamps the start and clears any previous end;
    /// entering a terminal state stamps the end.
    pub(crate) fn set_status(&mut self, status: RequestStatus, now: DateTime<Utc>) {
        match status {
            RequestStatus::Inflight => {
                self.started_at = Some(now);
                self.ended_at = None;
            }
            RequestStatus::Complete | RequestStatus::Failed => {
                self.ended_at = Some(now);
            }
            RequestStatus::Unsent | RequestStatus::PendingRetry => {}
        }
        self.status = status;
    }

    /// Full URL of this request against `base_url`, without the query string.
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    /// The `Retry-After` response header, if present. Lookup ignores case.
    pub fn retry_after(&self) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(RETRY_AFTER_HEADER))
            .map(|(_, value)| value.as_str())
    }

    /// Performs one attempt and classifies the outcome.
    ///
    /// Without connectivity the request is left untouched and its current
    /// status returned; no attempt is consumed. Otherwise `observer` sees the
    /// request once on entering `Inflight` and once after classification.
    pub async fn send<T: Transport>(
        &mut self,
        ctx: &SendContext<'_, T>,
        observer: &(dyn Fn(&ApiRequest) + Sync),
    ) -> RequestStatus {
        if !ctx.network.is_connected() {
            debug!(request_id = %self.id, "No connectivity, request left queued");
            return self.status;
        }

        self.attempts += 1;
        self.headers.insert(
            ATTEMPT_HEADER.to_string(),
            format!("{}/{}", self.attempts, ctx.max_retries),
        );
        self.set_status(RequestStatus::Inflight, ctx.clock.now());
        observer(self);

        let status = match ctx.transport.execute(self).await {
            Ok(response) => {
                let status = classify_response(response.status, self.attempts, ctx.max_retries);
                self.response_code = Some(response.status);
                self.response_headers = response.headers;
                self.response_body = Some(response.body);
                status
            }
            Err(e) => {
                warn!(request_id = %self.id, error = %e, "Transport error");
                self.response_code = None;
                self.response_headers.clear();
                self.response_body = None;
                RequestStatus::Failed
            }
        };

        self.set_status(status, ctx.clock.now());
        observer(self);
        status
    }

    /// Parses the last response body as a collector error document.
    pub fn error_response(&self) -> ErrorResponse {
        match &self.response_body {
            Some(body) if !body.trim().is_empty() => ErrorResponse::parse(body),
            _ => ErrorResponse::default(),
        }
    }
}

impl PartialEq for ApiRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ApiRequest {}

impl Hash for ApiRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Maps an HTTP status to the next request status.
///
/// A 429 stays retryable while `attempts <= max_retries`.
pub fn classify_response(code: u16, attempts: u32, max_retries: u32) -> RequestStatus {
    match code {
        200..=299 => RequestStatus::Complete,
        RATE_LIMITED if attempts <= max_retries => RequestStatus::PendingRetry,
        _ => RequestStatus::Failed,
    }
}
