use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Contract emitted by provider-specific sources (hook listeners, vendor
// JSONL/SQLite readers). Sources are external to this core; the adapter in
// the pipeline crate maps these into IngestRequests. Unknown enum values
// deserialize to the catch-all variants instead of failing the batch.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryChannel {
    Hook,
    Sse,
    #[default]
    Jsonl,
    Sqlite,
    Api,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventType {
    TurnCompleted,
    #[default]
    MessageUsage,
    ToolUsage,
    RawEnvelope,
    LimitSnapshot,
    ReconcileAdjustment,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryStatus {
    #[default]
    Ok,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

/// One usage signal as a provider-specific source reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub source_system: String,
    #[serde(default)]
    pub channel: TelemetryChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    #[serde(default)]
    pub event_type: TelemetryEventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_canonical: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_lineage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default)]
    pub status: TelemetryStatus,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl TelemetryEvent {
    pub fn new(source_system: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            channel: TelemetryChannel::default(),
            schema_version: None,
            occurred_at: None,
            workspace_id: None,
            session_id: None,
            turn_id: None,
            message_id: None,
            tool_call_id: None,
            provider: None,
            account: None,
            agent_name: None,
            event_type: TelemetryEventType::default(),
            model_raw: None,
            model_canonical: None,
            model_lineage: None,
            input_tokens: None,
            output_tokens: None,
            reasoning_tokens: None,
            cache_read_tokens: None,
            cache_write_tokens: None,
            total_tokens: None,
            cost_usd: None,
            request_count: None,
            tool_name: None,
            status: TelemetryStatus::default(),
            payload: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_enum_values_deserialize_to_catch_all() {
        let json = r#"{
            "source_system": "cursor",
            "channel": "carrier_pigeon",
            "event_type": "mood",
            "status": "vibes"
        }"#;
        let event: TelemetryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.channel, TelemetryChannel::Unknown);
        assert_eq!(event.event_type, TelemetryEventType::Unknown);
        assert_eq!(event.status, TelemetryStatus::Unknown);
    }
}
