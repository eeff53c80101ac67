use chrono::{DateTime, Utc};

/// Fixed-width UTC text format used for every timestamp the store persists.
/// Lexicographic order over these strings equals chronological order.
pub const STORE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_store_time(ts: DateTime<Utc>) -> String {
    ts.format(STORE_TIME_FORMAT).to_string()
}

pub fn parse_store_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// True when the optional string is absent or whitespace-only.
pub fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|s| s.trim().is_empty())
}

/// Sanitize an identifier for use inside a metric name: lowercase, trim,
/// collapse runs of non-alphanumeric code points into a single underscore,
/// trim leading/trailing underscores. Empty results become `unknown`.
pub fn sanitize_metric_id(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_separator = false;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            out.push(ch);
            pending_separator = false;
        } else {
            pending_separator = true;
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}
