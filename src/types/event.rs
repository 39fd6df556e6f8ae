//! Tracked events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A metric occurrence to be attributed to a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Metric name, e.g. `Opened App` or `Added To Cart`.
    pub metric: String,
    /// Optional numeric value such as an order total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Event {
    pub fn new(metric: impl Into<String>) -> Self {
        Event {
            metric: metric.into(),
            value: None,
            properties: Map::new(),
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
