//! JSON form of a queued request, as written to the data store.
//!
//! ```json
//! {
//!   "request_type": "event",
//!   "url_path": "client/events/",
//!   "method": "POST",
//!   "time": 1700000000000,
//!   "uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8",
//!   "headers": { "Revision": "2023-07-15" },
//!   "query": { "company_id": "Xr5bFG" },
//!   "body": { "data": { ... } }
//! }
//! ```
//!
//! Unknown keys are ignored. `url_path`, `method`, `time` and `uuid` are
//! required; `headers` and `query` default to empty. Only the fields needed
//! to resend are kept: attempts and response data start fresh after a
//! restore.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{ApiRequest, Method, RequestKind};
use crate::types::RequestId;

/// Errors that make a stored request unusable.
#[derive(Debug, Error)]
pub enum RequestDecodeError {
    #[error("invalid request JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown HTTP method {0:?}")]
    UnknownMethod(String),

    #[error("timestamp {0} is out of range")]
    InvalidTime(i64),
}

/// Result type for request decoding.
pub type Result<T> = std::result::Result<T, RequestDecodeError>;

/// Wire shape of a stored request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    pub url_path: String,
    pub method: String,
    /// Queued time in milliseconds since the Unix epoch.
    pub time: i64,
    pub uuid: RequestId,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl From<&ApiRequest> for PersistedRequest {
    fn from(request: &ApiRequest) -> Self {
        PersistedRequest {
            request_type: Some(request.kind.as_str().to_string()),
            url_path: request.path.clone(),
            method: request.method.as_str().to_string(),
            time: request.queued_at.timestamp_millis(),
            uuid: request.id,
            headers: request.headers.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
        }
    }
}

impl TryFrom<PersistedRequest> for ApiRequest {
    type Error = RequestDecodeError;

    fn try_from(persisted: PersistedRequest) -> Result<Self> {
        let method = match persisted.method.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => return Err(RequestDecodeError::UnknownMethod(persisted.method)),
        };
        let queued_at = DateTime::from_timestamp_millis(persisted.time)
            .ok_or(RequestDecodeError::InvalidTime(persisted.time))?;
        let kind = persisted
            .request_type
            .as_deref()
            .map(RequestKind::from_name)
            .unwrap_or(RequestKind::Generic);

        let mut request = ApiRequest::new(kind, persisted.url_path, method, queued_at)
            .with_id(persisted.uuid);
        request.headers = persisted.headers;
        request.query = persisted.query;
        request.body = persisted.body;
        Ok(request)
    }
}

/// Serializes a request to its stored JSON text.
pub fn encode(request: &ApiRequest) -> Result<String> {
    Ok(serde_json::to_string(&PersistedRequest::from(request))?)
}

/// Parses stored JSON text back into an `Unsent` request.
pub fn decode(json: &str) -> Result<ApiRequest> {
    let persisted: PersistedRequest = serde_json::from_str(json)?;
    ApiRequest::try_from(persisted)
}
