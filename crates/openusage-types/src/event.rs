use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// How a telemetry record arrived. Determines enrichment override priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Hook,
    Sse,
    Jsonl,
    Sqlite,
    Api,
    #[serde(other)]
    Other,
}

impl SourceChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceChannel::Hook => "hook",
            SourceChannel::Sse => "sse",
            SourceChannel::Jsonl => "jsonl",
            SourceChannel::Sqlite => "sqlite",
            SourceChannel::Api => "api",
            SourceChannel::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "hook" => SourceChannel::Hook,
            "sse" => SourceChannel::Sse,
            "jsonl" => SourceChannel::Jsonl,
            "sqlite" => SourceChannel::Sqlite,
            "api" => SourceChannel::Api,
            _ => SourceChannel::Other,
        }
    }

    /// Enrichment override priority: a higher-priority arrival may
    /// overwrite fields a lower-priority arrival populated.
    pub fn priority(&self) -> i64 {
        match self {
            SourceChannel::Hook => 4,
            SourceChannel::Sse => 3,
            SourceChannel::Sqlite | SourceChannel::Jsonl => 2,
            SourceChannel::Api => 1,
            SourceChannel::Other => 0,
        }
    }
}

/// Kind of canonical usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TurnCompleted,
    MessageUsage,
    ToolUsage,
    RawEnvelope,
    LimitSnapshot,
    ReconcileAdjustment,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TurnCompleted => "turn_completed",
            EventType::MessageUsage => "message_usage",
            EventType::ToolUsage => "tool_usage",
            EventType::RawEnvelope => "raw_envelope",
            EventType::LimitSnapshot => "limit_snapshot",
            EventType::ReconcileAdjustment => "reconcile_adjustment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "turn_completed" => Some(EventType::TurnCompleted),
            "message_usage" => Some(EventType::MessageUsage),
            "tool_usage" => Some(EventType::ToolUsage),
            "raw_envelope" => Some(EventType::RawEnvelope),
            "limit_snapshot" => Some(EventType::LimitSnapshot),
            "reconcile_adjustment" => Some(EventType::ReconcileAdjustment),
            _ => None,
        }
    }
}

/// Outcome reported by the source for the underlying operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Error,
    Aborted,
    Unknown,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Error => "error",
            EventStatus::Aborted => "aborted",
            EventStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "ok" => EventStatus::Ok,
            "error" => EventStatus::Error,
            "aborted" => EventStatus::Aborted,
            _ => EventStatus::Unknown,
        }
    }
}

/// Opaque source payload carried alongside a request.
///
/// The storage layer only ever sees bytes plus a content hash; the tagged
/// value shape exists so callers can hand over decoded JSON without a
/// re-serialize round trip through strings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Value(Value),
    Bytes(Vec<u8>),
    #[default]
    Empty,
}

impl Payload {
    /// Bytes persisted for this payload. Empty payloads serialize to `{}`;
    /// raw bytes pass through verbatim.
    pub fn storage_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Value(value) => serde_json::to_vec(value).map_err(Error::Serialize),
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Empty => Ok(b"{}".to_vec()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// Input to the ingest pipeline: one usage signal as a collector saw it.
///
/// Optional fields left `None` are filled by normalization where a default
/// exists (see `normalize`). The payload is retained verbatim and never
/// interpreted by the core except for `limit_snapshot` envelopes at read
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_system: String,
    pub source_channel: SourceChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_schema_version: Option<String>,
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
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,

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

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization_version: Option<String>,

    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,
}

impl IngestRequest {
    pub fn new(source_system: impl Into<String>, source_channel: SourceChannel) -> Self {
        Self {
            source_system: source_system.into(),
            source_channel,
            source_schema_version: None,
            occurred_at: None,
            workspace_id: None,
            session_id: None,
            turn_id: None,
            message_id: None,
            tool_call_id: None,
            provider_id: None,
            account_id: None,
            agent_name: None,
            event_type: None,
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
            status: None,
            normalization_version: None,
            payload: Payload::Empty,
        }
    }
}
