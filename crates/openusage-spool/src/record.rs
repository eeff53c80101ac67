use chrono::{DateTime, Utc};
use openusage_types::SourceChannel;
use serde::{Deserialize, Serialize};

/// One queued request on disk. `payload` is the serialized `IngestRequest`
/// the pipeline marshalled at enqueue time; the spool never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    /// Assigned at append when empty.
    #[serde(default)]
    pub spool_id: String,

    /// Assigned at append when unset. UTC; drives filename ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    pub source_system: String,
    pub source_channel: SourceChannel,

    pub payload: String,

    /// Number of failed ingest attempts so far.
    #[serde(default)]
    pub attempt: u32,

    /// Truncated reason of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SpoolRecord {
    pub fn new(
        source_system: impl Into<String>,
        source_channel: SourceChannel,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            spool_id: String::new(),
            created_at: None,
            source_system: source_system.into(),
            source_channel,
            payload: payload.into(),
            attempt: 0,
            last_error: None,
        }
    }
}
