use sha2::{Digest, Sha256};

use crate::event::{EventType, IngestRequest};

/// Build the stable fingerprint a canonical event is deduplicated on.
///
/// When the request carries a stable identifier (`tool_call_id`, else
/// `message_id`, else `turn_id`) the key covers only source system, event
/// type, session id, workspace id and the prefixed stable id, so the same
/// logical event re-arriving from another channel with drifted timestamps,
/// metrics, models or provider/account/agent strings still collides and
/// triggers enrichment. Without a stable identifier the key additionally
/// mixes the millisecond-truncated timestamp, model strings, tool name, the
/// token tuple, cost and request count so structurally similar but
/// unrelated events stay apart.
pub fn build_dedup_key(request: &IngestRequest) -> String {
    let event_type = request.event_type.unwrap_or(EventType::MessageUsage);

    let mut parts: Vec<String> = vec![
        norm(&request.source_system),
        event_type.as_str().to_string(),
        norm_opt(&request.session_id),
        norm_opt(&request.workspace_id),
    ];

    match stable_identifier(request) {
        Some(stable) => parts.push(stable),
        None => {
            parts.push(
                request
                    .occurred_at
                    .map(|ts| ts.timestamp_millis().to_string())
                    .unwrap_or_default(),
            );
            parts.push(norm_opt(&request.model_raw));
            parts.push(norm_opt(&request.model_canonical));
            parts.push(norm_opt(&request.model_lineage));
            parts.push(norm_opt(&request.tool_name));
            parts.push(fmt_count(request.input_tokens));
            parts.push(fmt_count(request.output_tokens));
            parts.push(fmt_count(request.reasoning_tokens));
            parts.push(fmt_count(request.cache_read_tokens));
            parts.push(fmt_count(request.cache_write_tokens));
            parts.push(fmt_count(request.total_tokens));
            parts.push(fmt_cost(request.cost_usd));
            parts.push(fmt_count(request.request_count));
        }
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    format!("{:x}", digest)
}

/// Highest-priority stable identifier present on the request, prefixed so
/// id namespaces cannot collide across kinds.
fn stable_identifier(request: &IngestRequest) -> Option<String> {
    let candidates = [
        ("tool", &request.tool_call_id),
        ("message", &request.message_id),
        ("turn", &request.turn_id),
    ];
    for (prefix, id) in candidates {
        if let Some(id) = id.as_deref()
            && !id.trim().is_empty()
        {
            return Some(format!("{}:{}", prefix, norm(id)));
        }
    }
    None
}

fn norm(value: &str) -> String {
    value.trim().to_lowercase()
}

fn norm_opt(value: &Option<String>) -> String {
    value.as_deref().map(norm).unwrap_or_default()
}

fn fmt_count(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn fmt_cost(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceChannel;
    use chrono::{TimeZone, Utc};

    fn base_request() -> IngestRequest {
        let mut request = IngestRequest::new("claude_code", SourceChannel::Hook);
        request.session_id = Some("sess-1".to_string());
        request.workspace_id = Some("ws-1".to_string());
        request.event_type = Some(EventType::MessageUsage);
        request
    }

    #[test]
    fn test_stable_id_survives_metric_and_model_drift() {
        let mut a = base_request();
        a.message_id = Some("msg-9".to_string());
        a.input_tokens = Some(120);
        a.model_raw = Some("model-x".to_string());
        a.occurred_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        a.provider_id = Some("anthropic".to_string());

        let mut b = base_request();
        b.message_id = Some("msg-9".to_string());
        b.input_tokens = Some(100);
        b.output_tokens = Some(30);
        b.model_raw = Some("model-y".to_string());
        b.occurred_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
        b.provider_id = Some("claude_code".to_string());
        b.account_id = Some("work".to_string());
        b.cost_usd = Some(0.01);

        assert_eq!(build_dedup_key(&a), build_dedup_key(&b));
    }

    #[test]
    fn test_tool_call_id_wins_over_message_id() {
        let mut a = base_request();
        a.tool_call_id = Some("call-1".to_string());
        a.message_id = Some("msg-1".to_string());

        let mut b = base_request();
        b.tool_call_id = Some("call-1".to_string());
        b.message_id = Some("msg-2".to_string());

        assert_eq!(build_dedup_key(&a), build_dedup_key(&b));
    }

    #[test]
    fn test_identifier_kinds_do_not_collide() {
        let mut by_message = base_request();
        by_message.message_id = Some("shared".to_string());

        let mut by_turn = base_request();
        by_turn.turn_id = Some("shared".to_string());

        assert_ne!(build_dedup_key(&by_message), build_dedup_key(&by_turn));
    }

    #[test]
    fn test_fallback_separates_differing_token_tuples() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut a = base_request();
        a.occurred_at = Some(at);
        a.input_tokens = Some(10);

        let mut b = base_request();
        b.occurred_at = Some(at);
        b.input_tokens = Some(11);

        assert_ne!(build_dedup_key(&a), build_dedup_key(&b));
    }

    #[test]
    fn test_whitespace_and_case_insensitive() {
        let mut a = base_request();
        a.source_system = "Claude_Code".to_string();
        a.session_id = Some("  SESS-1 ".to_string());
        a.message_id = Some("MSG-9".to_string());

        let mut b = base_request();
        b.message_id = Some("msg-9 ".to_string());

        assert_eq!(build_dedup_key(&a), build_dedup_key(&b));
    }

    #[test]
    fn test_session_scopes_the_key() {
        let mut a = base_request();
        a.message_id = Some("msg-9".to_string());

        let mut b = base_request();
        b.session_id = Some("sess-2".to_string());
        b.message_id = Some("msg-9".to_string());

        assert_ne!(build_dedup_key(&a), build_dedup_key(&b));
    }
}
