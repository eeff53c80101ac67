use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use openusage_store::{IngestOutcome, Store};
use openusage_types::{
    EventStatus, EventType, IngestRequest, LimitSnapshotEnvelope, Payload, SourceChannel,
    UsageSnapshot,
};

pub use openusage_types::{POLLER_SOURCE_SYSTEM, SNAPSHOT_SCHEMA_VERSION};

/// Lift provider-pull quota snapshots into the event stream, so observed
/// usage and reported quota live in one place.
///
/// Accounts are iterated in lexicographic order (the map is ordered), so
/// output is stable. The turn id encodes provider, account and the
/// second-truncated timestamp; re-polling within the same second therefore
/// deduplicates at the store.
pub fn snapshot_requests(
    snapshots: &BTreeMap<String, UsageSnapshot>,
    now: DateTime<Utc>,
) -> Result<Vec<IngestRequest>> {
    let mut requests = Vec::with_capacity(snapshots.len());

    for (account_id, snapshot) in snapshots {
        let occurred_at = snapshot.timestamp.unwrap_or(now);

        let envelope = LimitSnapshotEnvelope {
            provider_id: snapshot.provider_id.clone(),
            account_id: account_id.clone(),
            status: snapshot.status.clone(),
            message: snapshot.message.clone(),
            metrics: snapshot.metrics.clone(),
            resets: snapshot.resets.clone(),
            attributes: snapshot.attributes.clone(),
            diagnostics: snapshot.diagnostics.clone(),
        };
        let payload = serde_json::to_value(&envelope)
            .with_context(|| format!("encode limit snapshot for account {}", account_id))?;

        let mut request = IngestRequest::new(POLLER_SOURCE_SYSTEM, SourceChannel::Api);
        request.source_schema_version = Some(SNAPSHOT_SCHEMA_VERSION.to_string());
        request.occurred_at = Some(occurred_at);
        request.provider_id = Some(snapshot.provider_id.clone());
        request.account_id = Some(account_id.clone());
        request.turn_id = Some(format!(
            "snapshot:{}:{}:{}",
            snapshot.provider_id,
            account_id,
            occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        request.event_type = Some(EventType::LimitSnapshot);
        request.status = Some(map_snapshot_status(&snapshot.status));
        request.payload = Payload::Value(payload);

        requests.push(request);
    }

    Ok(requests)
}

/// Build and ingest the snapshot events directly through the store.
pub fn ingest_usage_snapshots(
    store: &Store,
    snapshots: &BTreeMap<String, UsageSnapshot>,
) -> Result<Vec<IngestOutcome>> {
    let requests = snapshot_requests(snapshots, Utc::now())?;
    let mut outcomes = Vec::with_capacity(requests.len());
    for request in &requests {
        let outcome = store.ingest(request).context("ingest limit snapshot")?;
        debug!(
            event_id = %outcome.event_id,
            deduped = outcome.deduped,
            "stored limit snapshot"
        );
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn map_snapshot_status(status: &str) -> EventStatus {
    let status = status.trim();
    if status.eq_ignore_ascii_case("error") {
        EventStatus::Error
    } else if status.eq_ignore_ascii_case("limited") {
        EventStatus::Aborted
    } else {
        EventStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use openusage_types::Metric;

    fn snapshot_map() -> BTreeMap<String, UsageSnapshot> {
        let mut snapshot = UsageSnapshot::new("claude_code", "work");
        snapshot.timestamp = Some(Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 15).unwrap());
        snapshot.status = "OK".to_string();
        snapshot.metrics.insert(
            "credit_balance".to_string(),
            Metric {
                limit: Some(100.0),
                remaining: Some(92.08),
                used: Some(7.92),
                unit: Some("usd".to_string()),
                window: None,
            },
        );
        snapshot
            .resets
            .insert("daily".to_string(), Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 0).unwrap());

        let mut map = BTreeMap::new();
        map.insert("work".to_string(), snapshot);
        map
    }

    #[test]
    fn test_requests_are_shaped_for_dedup() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let requests = snapshot_requests(&snapshot_map(), now).unwrap();
        assert_eq!(requests.len(), 1);

        let request = &requests[0];
        assert_eq!(request.source_system, POLLER_SOURCE_SYSTEM);
        assert_eq!(request.source_channel, SourceChannel::Api);
        assert_eq!(
            request.source_schema_version.as_deref(),
            Some(SNAPSHOT_SCHEMA_VERSION)
        );
        assert_eq!(request.event_type, Some(EventType::LimitSnapshot));
        assert_eq!(request.status, Some(EventStatus::Ok));
        assert_eq!(
            request.turn_id.as_deref(),
            Some("snapshot:claude_code:work:2026-06-01T09:30:15Z")
        );
    }

    #[test]
    fn test_missing_timestamp_uses_now() {
        let mut map = snapshot_map();
        map.get_mut("work").unwrap().timestamp = None;
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();

        let requests = snapshot_requests(&map, now).unwrap();
        assert_eq!(requests[0].occurred_at, Some(now));
        assert_eq!(
            requests[0].turn_id.as_deref(),
            Some("snapshot:claude_code:work:2026-06-01T10:00:00Z")
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_snapshot_status("error"), EventStatus::Error);
        assert_eq!(map_snapshot_status("LIMITED"), EventStatus::Aborted);
        assert_eq!(map_snapshot_status("ok"), EventStatus::Ok);
        assert_eq!(map_snapshot_status(""), EventStatus::Ok);
        assert_eq!(map_snapshot_status("degraded"), EventStatus::Ok);
    }

    #[test]
    fn test_envelope_round_trips() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let requests = snapshot_requests(&snapshot_map(), now).unwrap();
        let Payload::Value(value) = &requests[0].payload else {
            panic!("expected a value payload");
        };

        let envelope: LimitSnapshotEnvelope = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(envelope.provider_id, "claude_code");
        assert_eq!(envelope.account_id, "work");
        assert_eq!(envelope.metrics["credit_balance"].used, Some(7.92));
        assert!(envelope.resets.contains_key("daily"));
    }

    #[test]
    fn test_repoll_within_a_second_deduplicates() {
        let store = Store::open_in_memory().unwrap();
        let map = snapshot_map();

        let first = ingest_usage_snapshots(&store, &map).unwrap();
        let second = ingest_usage_snapshots(&store, &map).unwrap();

        assert!(!first[0].deduped);
        assert!(second[0].deduped);
        assert_eq!(first[0].event_id, second[0].event_id);
        assert_eq!(store.canonical_event_count().unwrap(), 1);
        assert_eq!(store.raw_event_count().unwrap(), 2);
    }

    #[test]
    fn test_accounts_emit_in_lexicographic_order() {
        let mut map = snapshot_map();
        map.insert("alpha".to_string(), UsageSnapshot::new("claude_code", "alpha"));
        map.insert("zeta".to_string(), UsageSnapshot::new("claude_code", "zeta"));

        let now = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let requests = snapshot_requests(&map, now).unwrap();
        let accounts: Vec<_> = requests
            .iter()
            .map(|r| r.account_id.clone().unwrap())
            .collect();
        assert_eq!(accounts, vec!["alpha", "work", "zeta"]);
    }
}
