//! Structured error documents returned by the collector on 4xx.

use serde::Deserialize;
use tracing::error;

/// Title of a field validation error.
pub const INVALID_INPUT_TITLE: &str = "Invalid input.";

/// Pointer naming the profile's email attribute.
pub const EMAIL_POINTER: &str = "/data/attributes/email";

/// Pointer naming the profile's phone number attribute.
pub const PHONE_NUMBER_POINTER: &str = "/data/attributes/phone_number";

/// `{"errors": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub source: Option<ErrorSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorSource {
    #[serde(default)]
    pub pointer: String,
}

impl ErrorResponse {
    /// Parses `body`, yielding an empty error list if it is malformed.
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "Failed to parse error response body");
                ErrorResponse::default()
            }
        }
    }
}

impl ApiError {
    pub fn pointer(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.pointer.as_str())
    }

    pub fn is_invalid_input(&self) -> bool {
        self.title == INVALID_INPUT_TITLE
    }
}
