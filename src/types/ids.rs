//! Newtype wrappers for identifiers.
//!
//! These keep request ids and account keys from being confused with the
//! plain strings that flow through headers, query parameters and store keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a queued request.
///
/// Stable across serialization: it is the store key of the request's
/// persisted form, the dedup key of the queue, and the `unique_id` the
/// collector uses to discard duplicate deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }

    /// Returns the hyphenated string form used as a store key.
    pub fn to_key(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RequestId)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        RequestId(id)
    }
}

/// Public API key identifying the account requests are attributed to.
///
/// Sent as the `company_id` query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(pub String);

impl ApiKey {
    pub fn new(s: impl Into<String>) -> Self {
        ApiKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(s)
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn request_id_display_is_hyphenated_uuid() {
        let id: RequestId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        assert_eq!(id.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(id.to_key(), id.to_string());
    }

    #[test]
    fn request_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn request_id_serializes_as_plain_string() {
        let id: RequestId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"67e55044-10b1-426f-9247-bb680e5fe0c8\"");
    }

    #[test]
    fn blank_api_key_is_empty() {
        assert!(ApiKey::new("  ").is_empty());
        assert!(!ApiKey::new("Xr5bFG").is_empty());
    }

    proptest! {
        #[test]
        fn request_id_parses_its_own_display(bytes in any::<[u8; 16]>()) {
            let id = RequestId(Uuid::from_bytes(bytes));
            let parsed: RequestId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
