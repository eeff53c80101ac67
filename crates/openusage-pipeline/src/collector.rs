use anyhow::Result;
use tokio_util::sync::CancellationToken;

use openusage_types::{
    EventStatus, EventType, IngestRequest, Payload, SourceChannel, TelemetryChannel,
    TelemetryEvent, TelemetryEventType, TelemetryStatus,
};

/// Anything that can produce an ordered batch of requests for the pipeline.
/// Implementations must tolerate being called repeatedly and should return
/// early (with whatever they have) once the token is cancelled.
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;
    fn collect(&self, cancel: &CancellationToken) -> Result<Vec<IngestRequest>>;
}

/// Boundary trait for provider-specific sources: hook listeners, vendor
/// JSONL readers, vendor SQLite readers. They emit `TelemetryEvent`s; the
/// `SourceCollector` adapter turns those into `IngestRequest`s.
pub trait TelemetrySource: Send + Sync {
    fn name(&self) -> &str;
    fn events(&self, cancel: &CancellationToken) -> Result<Vec<TelemetryEvent>>;
}

/// Adapter from a `TelemetrySource` to the `Collector` interface, with an
/// optional account override applied to every mapped request.
pub struct SourceCollector {
    source: Box<dyn TelemetrySource>,
    account_override: Option<String>,
}

impl SourceCollector {
    pub fn new(source: Box<dyn TelemetrySource>) -> Self {
        Self {
            source,
            account_override: None,
        }
    }

    pub fn with_account_override(mut self, account: impl Into<String>) -> Self {
        self.account_override = Some(account.into());
        self
    }
}

impl Collector for SourceCollector {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn collect(&self, cancel: &CancellationToken) -> Result<Vec<IngestRequest>> {
        let events = self.source.events(cancel)?;
        Ok(events
            .into_iter()
            .map(|event| {
                map_telemetry_event(self.source.name(), event, self.account_override.as_deref())
            })
            .collect())
    }
}

/// Map one source event onto the canonical request shape.
///
/// Enums map one-to-one; unknown values collapse to `jsonl`,
/// `message_usage` and `ok`. The account id is chosen by precedence:
/// explicit override > event account > event provider > source-system name
/// > the literal `default`.
pub fn map_telemetry_event(
    source_name: &str,
    event: TelemetryEvent,
    account_override: Option<&str>,
) -> IngestRequest {
    let source_system = non_blank(&event.source_system)
        .unwrap_or(source_name)
        .to_string();

    let account_id = account_override
        .and_then(non_blank)
        .map(str::to_string)
        .or_else(|| event.account.clone().filter(|s| !s.trim().is_empty()))
        .or_else(|| event.provider.clone().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| {
            non_blank(&source_system)
                .map(str::to_string)
                .unwrap_or_else(|| "default".to_string())
        });

    let mut request = IngestRequest::new(source_system.clone(), map_channel(event.channel));
    request.source_schema_version = event.schema_version;
    request.occurred_at = event.occurred_at;
    request.workspace_id = event.workspace_id;
    request.session_id = event.session_id;
    request.turn_id = event.turn_id;
    request.message_id = event.message_id;
    request.tool_call_id = event.tool_call_id;
    request.provider_id = event.provider;
    request.account_id = Some(account_id);
    request.agent_name = event
        .agent_name
        .filter(|s| !s.trim().is_empty())
        .or(Some(source_system));
    request.event_type = Some(map_event_type(event.event_type));
    request.model_raw = event.model_raw;
    request.model_canonical = event.model_canonical;
    request.model_lineage = event.model_lineage;
    request.input_tokens = event.input_tokens;
    request.output_tokens = event.output_tokens;
    request.reasoning_tokens = event.reasoning_tokens;
    request.cache_read_tokens = event.cache_read_tokens;
    request.cache_write_tokens = event.cache_write_tokens;
    request.total_tokens = event.total_tokens;
    request.cost_usd = event.cost_usd;
    request.request_count = event.request_count;
    request.tool_name = event.tool_name;
    request.status = Some(map_status(event.status));
    request.payload = if event.payload.is_null() {
        Payload::Empty
    } else {
        Payload::Value(event.payload)
    };
    request
}

fn map_channel(channel: TelemetryChannel) -> SourceChannel {
    match channel {
        TelemetryChannel::Hook => SourceChannel::Hook,
        TelemetryChannel::Sse => SourceChannel::Sse,
        TelemetryChannel::Jsonl => SourceChannel::Jsonl,
        TelemetryChannel::Sqlite => SourceChannel::Sqlite,
        TelemetryChannel::Api => SourceChannel::Api,
        TelemetryChannel::Unknown => SourceChannel::Jsonl,
    }
}

fn map_event_type(event_type: TelemetryEventType) -> EventType {
    match event_type {
        TelemetryEventType::TurnCompleted => EventType::TurnCompleted,
        TelemetryEventType::MessageUsage => EventType::MessageUsage,
        TelemetryEventType::ToolUsage => EventType::ToolUsage,
        TelemetryEventType::RawEnvelope => EventType::RawEnvelope,
        TelemetryEventType::LimitSnapshot => EventType::LimitSnapshot,
        TelemetryEventType::ReconcileAdjustment => EventType::ReconcileAdjustment,
        TelemetryEventType::Unknown => EventType::MessageUsage,
    }
}

fn map_status(status: TelemetryStatus) -> EventStatus {
    match status {
        TelemetryStatus::Ok => EventStatus::Ok,
        TelemetryStatus::Error => EventStatus::Error,
        TelemetryStatus::Aborted => EventStatus::Aborted,
        TelemetryStatus::Unknown => EventStatus::Ok,
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TelemetryEvent {
        let mut event = TelemetryEvent::new("claude_code");
        event.channel = TelemetryChannel::Hook;
        event.event_type = TelemetryEventType::ToolUsage;
        event.status = TelemetryStatus::Aborted;
        event.session_id = Some("s1".to_string());
        event.tool_call_id = Some("call-1".to_string());
        event.provider = Some("anthropic".to_string());
        event.input_tokens = Some(10);
        event
    }

    #[test]
    fn test_enums_map_one_to_one() {
        let request = map_telemetry_event("claude-source", event(), None);
        assert_eq!(request.source_channel, SourceChannel::Hook);
        assert_eq!(request.event_type, Some(EventType::ToolUsage));
        assert_eq!(request.status, Some(EventStatus::Aborted));
        assert_eq!(request.input_tokens, Some(10));
        assert_eq!(request.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_unknown_enums_collapse_to_defaults() {
        let mut e = event();
        e.channel = TelemetryChannel::Unknown;
        e.event_type = TelemetryEventType::Unknown;
        e.status = TelemetryStatus::Unknown;

        let request = map_telemetry_event("claude-source", e, None);
        assert_eq!(request.source_channel, SourceChannel::Jsonl);
        assert_eq!(request.event_type, Some(EventType::MessageUsage));
        assert_eq!(request.status, Some(EventStatus::Ok));
    }

    #[test]
    fn test_account_precedence() {
        // Override wins over everything.
        let request = map_telemetry_event("src", event(), Some("override-acct"));
        assert_eq!(request.account_id.as_deref(), Some("override-acct"));

        // Event account beats provider.
        let mut e = event();
        e.account = Some("event-acct".to_string());
        let request = map_telemetry_event("src", e, None);
        assert_eq!(request.account_id.as_deref(), Some("event-acct"));

        // Provider beats source system.
        let request = map_telemetry_event("src", event(), None);
        assert_eq!(request.account_id.as_deref(), Some("anthropic"));

        // Source system beats the literal default.
        let mut e = event();
        e.provider = None;
        let request = map_telemetry_event("src", e, None);
        assert_eq!(request.account_id.as_deref(), Some("claude_code"));
    }

    #[test]
    fn test_agent_name_falls_back_to_source_system() {
        let request = map_telemetry_event("src", event(), None);
        assert_eq!(request.agent_name.as_deref(), Some("claude_code"));

        let mut e = event();
        e.agent_name = Some("custom-agent".to_string());
        let request = map_telemetry_event("src", e, None);
        assert_eq!(request.agent_name.as_deref(), Some("custom-agent"));
    }

    #[test]
    fn test_blank_source_system_uses_collector_name() {
        let mut e = event();
        e.source_system = "  ".to_string();
        e.provider = None;
        let request = map_telemetry_event("fallback-src", e, None);
        assert_eq!(request.source_system, "fallback-src");
        assert_eq!(request.account_id.as_deref(), Some("fallback-src"));
    }

    #[test]
    fn test_payload_passes_through() {
        let mut e = event();
        e.payload = serde_json::json!({"hook": "payload"});
        let request = map_telemetry_event("src", e, None);
        assert_eq!(
            request.payload,
            Payload::Value(serde_json::json!({"hook": "payload"}))
        );

        let request = map_telemetry_event("src", event(), None);
        assert_eq!(request.payload, Payload::Empty);
    }
}
