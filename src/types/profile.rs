//! Profile identifiers and attributes.
//!
//! A [`Profile`] is a snapshot of who the user is (identifiers) plus what we
//! know about them (attributes). Profiles merge field-by-field with the newer
//! value winning, which is how rapid successive mutations collapse into one
//! outbound update.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Every profile attribute the collector recognises, plus custom keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProfileKey {
    // Identifiers
    ExternalId,
    Email,
    PhoneNumber,
    AnonymousId,

    // Personal information
    FirstName,
    LastName,
    Organization,
    Title,
    Image,

    // Location
    Address1,
    Address2,
    City,
    Country,
    Latitude,
    Longitude,
    Region,
    Zip,
    Timezone,

    /// Any other key, sent under `properties`.
    Custom(String),
}

impl ProfileKey {
    /// Keys placed directly under the body's `attributes` object.
    pub const PERSONAL: [ProfileKey; 5] = [
        ProfileKey::FirstName,
        ProfileKey::LastName,
        ProfileKey::Organization,
        ProfileKey::Title,
        ProfileKey::Image,
    ];

    /// Keys placed under the body's `location` object.
    pub const LOCATION: [ProfileKey; 9] = [
        ProfileKey::Address1,
        ProfileKey::Address2,
        ProfileKey::City,
        ProfileKey::Country,
        ProfileKey::Latitude,
        ProfileKey::Longitude,
        ProfileKey::Region,
        ProfileKey::Zip,
        ProfileKey::Timezone,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ProfileKey::ExternalId => "external_id",
            ProfileKey::Email => "email",
            ProfileKey::PhoneNumber => "phone_number",
            ProfileKey::AnonymousId => "anonymous_id",
            ProfileKey::FirstName => "first_name",
            ProfileKey::LastName => "last_name",
            ProfileKey::Organization => "organization",
            ProfileKey::Title => "title",
            ProfileKey::Image => "image",
            ProfileKey::Address1 => "address1",
            ProfileKey::Address2 => "address2",
            ProfileKey::City => "city",
            ProfileKey::Country => "country",
            ProfileKey::Latitude => "latitude",
            ProfileKey::Longitude => "longitude",
            ProfileKey::Region => "region",
            ProfileKey::Zip => "zip",
            ProfileKey::Timezone => "timezone",
            ProfileKey::Custom(name) => name,
        }
    }

    /// Maps a wire name back to its key; unknown names become [`ProfileKey::Custom`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "external_id" => ProfileKey::ExternalId,
            "email" => ProfileKey::Email,
            "phone_number" => ProfileKey::PhoneNumber,
            "anonymous_id" => ProfileKey::AnonymousId,
            "first_name" => ProfileKey::FirstName,
            "last_name" => ProfileKey::LastName,
            "organization" => ProfileKey::Organization,
            "title" => ProfileKey::Title,
            "image" => ProfileKey::Image,
            "address1" => ProfileKey::Address1,
            "address2" => ProfileKey::Address2,
            "city" => ProfileKey::City,
            "country" => ProfileKey::Country,
            "latitude" => ProfileKey::Latitude,
            "longitude" => ProfileKey::Longitude,
            "region" => ProfileKey::Region,
            "zip" => ProfileKey::Zip,
            "timezone" => ProfileKey::Timezone,
            other => ProfileKey::Custom(other.to_string()),
        }
    }

    /// Returns true for the four identifier keys.
    pub fn is_identifier(&self) -> bool {
        matches!(
            self,
            ProfileKey::ExternalId
                | ProfileKey::Email
                | ProfileKey::PhoneNumber
                | ProfileKey::AnonymousId
        )
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers plus attributes of one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,
    /// Non-identifier attributes keyed by wire name.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone_number(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    pub fn with_anonymous_id(mut self, id: impl Into<String>) -> Self {
        self.anonymous_id = Some(id.into());
        self
    }

    pub fn with_attribute(mut self, key: ProfileKey, value: impl Into<Value>) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Sets one attribute.
    ///
    /// Identifier keys are routed to their dedicated fields; a non-string
    /// value for an identifier is stringified.
    pub fn set_attribute(&mut self, key: ProfileKey, value: impl Into<Value>) {
        let value = value.into();
        match key {
            ProfileKey::ExternalId => self.external_id = Some(stringify(&value)),
            ProfileKey::Email => self.email = Some(stringify(&value)),
            ProfileKey::PhoneNumber => self.phone_number = Some(stringify(&value)),
            ProfileKey::AnonymousId => self.anonymous_id = Some(stringify(&value)),
            other => {
                self.attributes.insert(other.as_str().to_string(), value);
            }
        }
    }

    /// Returns the value stored for `key`, identifiers included.
    pub fn attribute(&self, key: &ProfileKey) -> Option<Value> {
        let identifier = |v: &Option<String>| v.clone().map(Value::String);
        match key {
            ProfileKey::ExternalId => identifier(&self.external_id),
            ProfileKey::Email => identifier(&self.email),
            ProfileKey::PhoneNumber => identifier(&self.phone_number),
            ProfileKey::AnonymousId => identifier(&self.anonymous_id),
            other => self.attributes.get(other.as_str()).cloned(),
        }
    }

    /// Merges `newer` into this profile. Values present in `newer` win.
    pub fn merge(&mut self, newer: Profile) {
        if newer.external_id.is_some() {
            self.external_id = newer.external_id;
        }
        if newer.email.is_some() {
            self.email = newer.email;
        }
        if newer.phone_number.is_some() {
            self.phone_number = newer.phone_number;
        }
        if newer.anonymous_id.is_some() {
            self.anonymous_id = newer.anonymous_id;
        }
        self.attributes.extend(newer.attributes);
    }

    /// Consuming variant of [`Profile::merge`].
    pub fn merged(mut self, newer: Profile) -> Self {
        self.merge(newer);
        self
    }

    /// A copy holding only the identifiers.
    pub fn identifiers(&self) -> Profile {
        Profile {
            attributes: Map::new(),
            ..self.clone()
        }
    }

    /// True when at least one of external id, email or phone is set.
    pub fn has_external_identifier(&self) -> bool {
        [&self.external_id, &self.email, &self.phone_number]
            .into_iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
