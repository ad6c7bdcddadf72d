//! Alert payloads pushed in by the alert engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A threshold breach or lifecycle event on a monitored resource. The
/// incident store records these into timelines and the pattern detector
/// maps them onto historical event types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub level: String,
    pub resource_id: String,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ack_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_time: Option<DateTime<Utc>>,
}
