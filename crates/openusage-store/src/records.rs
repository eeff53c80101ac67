use chrono::{DateTime, Utc};
use openusage_types::{EventStatus, EventType, SourceChannel};

/// Immutable audit record of one arrival.
#[derive(Debug, Clone)]
pub struct RawEventRow {
    pub raw_event_id: String,
    pub ingested_at: DateTime<Utc>,
    pub source_system: String,
    pub source_channel: SourceChannel,
    pub source_schema_version: String,
    pub payload: Vec<u8>,
    pub payload_sha256: String,
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
}

/// The deduplicated, normalized fact. References the raw event that
/// created it; later duplicate arrivals enrich the fields in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEventRow {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub provider_id: Option<String>,
    pub agent_name: Option<String>,
    pub account_id: Option<String>,
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
    pub turn_id: Option<String>,
    pub message_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub event_type: EventType,
    pub model_raw: Option<String>,
    pub model_canonical: Option<String>,
    pub model_lineage: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub request_count: Option<i64>,
    pub tool_name: Option<String>,
    pub status: EventStatus,
    pub dedup_key: String,
    pub raw_event_id: String,
    pub normalization_version: String,
}

/// What `Store::ingest` decided about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Canonical event id: fresh on first arrival, the existing row's id
    /// when the request deduplicated.
    pub event_id: String,
    /// Raw audit row written for this arrival (always fresh).
    pub raw_event_id: String,
    pub deduped: bool,
}
