use chrono::{DateTime, Utc};

use crate::event::{EventStatus, EventType, IngestRequest};
use crate::util::is_blank;

pub const DEFAULT_NORMALIZATION_VERSION: &str = "v1";
pub const DEFAULT_SOURCE_SCHEMA_VERSION: &str = "v1";

/// Fill derived fields of a request. Pure in (request, now); idempotent.
///
/// - `occurred_at` defaults to `now`; stored timestamps are always UTC.
/// - `agent_name` defaults to the source-system string.
/// - `event_type` defaults to `message_usage`, `status` to `ok`.
/// - `normalization_version` and `source_schema_version` default to `v1`.
/// - `total_tokens` is inferred as the sum of the present token fields when
///   absent; when every token field is absent it stays absent.
pub fn normalize(request: &IngestRequest, now: DateTime<Utc>) -> IngestRequest {
    let mut out = request.clone();

    if out.occurred_at.is_none() {
        out.occurred_at = Some(now);
    }
    if is_blank(&out.agent_name) {
        out.agent_name = Some(out.source_system.clone());
    }
    if out.event_type.is_none() {
        out.event_type = Some(EventType::MessageUsage);
    }
    if out.status.is_none() {
        out.status = Some(EventStatus::Ok);
    }
    if is_blank(&out.normalization_version) {
        out.normalization_version = Some(DEFAULT_NORMALIZATION_VERSION.to_string());
    }
    if is_blank(&out.source_schema_version) {
        out.source_schema_version = Some(DEFAULT_SOURCE_SCHEMA_VERSION.to_string());
    }

    if out.total_tokens.is_none() {
        let parts = [
            out.input_tokens,
            out.output_tokens,
            out.reasoning_tokens,
            out.cache_read_tokens,
            out.cache_write_tokens,
        ];
        if parts.iter().any(Option::is_some) {
            out.total_tokens = Some(parts.iter().map(|p| p.unwrap_or(0)).sum());
        }
    }

    out
}
