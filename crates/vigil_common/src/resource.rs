//! Resource snapshots fed to the change detector by the state provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TYPE_NODE: &str = "node";
pub const TYPE_VM: &str = "vm";
pub const TYPE_CONTAINER: &str = "container";
pub const TYPE_STORAGE: &str = "storage";

/// Key attributes of a monitored resource at one point in time. Only the
/// fields that participate in change detection are captured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub cpu_cores: i32,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub memory_bytes: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub disk_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<DateTime<Utc>>,
    pub snapshot_time: DateTime<Utc>,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}
