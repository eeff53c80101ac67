use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One quota or usage figure on a provider snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

impl Metric {
    pub fn used(value: f64) -> Self {
        Self {
            used: Some(value),
            ..Self::default()
        }
    }
}

/// One day of a daily series, date rendered as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: String,
    pub value: f64,
}

/// Provider usage snapshot as the daemon hands it over and as the read
/// model returns it. Maps are ordered so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub provider_id: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,
    #[serde(default)]
    pub resets: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, String>,
    #[serde(default)]
    pub raw: BTreeMap<String, Value>,
    #[serde(default)]
    pub daily_series: BTreeMap<String, Vec<DailyPoint>>,
}

impl UsageSnapshot {
    pub fn new(provider_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            account_id: account_id.into(),
            ..Self::default()
        }
    }
}

/// Source system stamped on quota-poller arrivals. The read model keys its
/// root hydration on it.
pub const POLLER_SOURCE_SYSTEM: &str = "provider_poller";

/// Schema version stamped on quota-poller arrivals.
pub const SNAPSHOT_SCHEMA_VERSION: &str = "provider_snapshot_v1";

/// Payload shape of a `limit_snapshot` event. Written by the quota-snapshot
/// ingestor, decoded again at read time when hydrating snapshot roots; the
/// only payload shape the core ever interprets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitSnapshotEnvelope {
    pub provider_id: String,
    pub account_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,
    #[serde(default)]
    pub resets: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, String>,
}
