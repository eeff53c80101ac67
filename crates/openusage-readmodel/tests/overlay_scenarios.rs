use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use openusage_pipeline::ingest_usage_snapshots;
use openusage_readmodel::{
    ATTR_TELEMETRY_ROOT, DIAG_UNMAPPED_PROVIDERS, ReadModel, ReadModelOptions,
};
use openusage_store::Store;
use openusage_types::{EventType, IngestRequest, Metric, SourceChannel, UsageSnapshot};

fn base_map(provider: &str, account: &str) -> BTreeMap<String, UsageSnapshot> {
    let mut map = BTreeMap::new();
    map.insert(provider.to_string(), UsageSnapshot::new(provider, account));
    map
}

fn message_event(provider: &str, account: &str) -> IngestRequest {
    let mut request = IngestRequest::new("claude_code", SourceChannel::Hook);
    request.session_id = Some("s1".to_string());
    request.message_id = Some("m1".to_string());
    request.provider_id = Some(provider.to_string());
    request.account_id = Some(account.to_string());
    request.model_raw = Some("claude-sonnet".to_string());
    request.input_tokens = Some(120);
    request.total_tokens = Some(160);
    request.cost_usd = Some(0.012);
    request
}

#[test]
fn overlay_preserves_root_quota() {
    let store = Store::open_in_memory().unwrap();
    store.ingest(&message_event("claude_code", "work")).unwrap();

    let mut base = base_map("claude_code", "work");
    base.get_mut("claude_code")
        .unwrap()
        .metrics
        .insert("credit_balance".to_string(), Metric::used(7.92));

    let out = ReadModel::new(&store).apply(&base, &ReadModelOptions::default());
    let snapshot = &out["claude_code"];

    // No limit_snapshot stored, so the base quota figure survives.
    assert_eq!(snapshot.metrics["credit_balance"].used, Some(7.92));
    assert_eq!(
        snapshot.metrics["model_claude_sonnet_input_tokens"].used,
        Some(120.0)
    );
    assert_eq!(
        snapshot.metrics["source_claude_code_requests"].used,
        Some(1.0)
    );
    assert!(!snapshot.attributes.contains_key(ATTR_TELEMETRY_ROOT));
}

#[test]
fn overlay_populates_tool_metrics() {
    let store = Store::open_in_memory().unwrap();
    store.ingest(&message_event("claude_code", "work")).unwrap();

    let mut tool = IngestRequest::new("claude_code", SourceChannel::Hook);
    tool.event_type = Some(EventType::ToolUsage);
    tool.session_id = Some("s1".to_string());
    tool.tool_call_id = Some("call-1".to_string());
    tool.tool_name = Some("Bash".to_string());
    tool.provider_id = Some("claude_code".to_string());
    tool.account_id = Some("work".to_string());
    store.ingest(&tool).unwrap();

    let out = ReadModel::new(&store).apply(
        &base_map("claude_code", "work"),
        &ReadModelOptions::default(),
    );
    let snapshot = &out["claude_code"];
    assert_eq!(snapshot.metrics["tool_bash"].used, Some(1.0));
    assert_eq!(snapshot.metrics["tool_bash_today"].used, Some(1.0));
}

#[test]
fn provider_link_folds_usage_and_clears_unmapped() {
    let store = Store::open_in_memory().unwrap();
    store.ingest(&message_event("anthropic", "work")).unwrap();

    let mut options = ReadModelOptions::default();
    options
        .provider_links
        .insert("anthropic".to_string(), "claude_code".to_string());

    let out = ReadModel::new(&store).apply(&base_map("claude_code", "work"), &options);
    let snapshot = &out["claude_code"];

    assert_eq!(
        snapshot.metrics["model_claude_sonnet_input_tokens"].used,
        Some(120.0)
    );
    assert!(!snapshot.diagnostics.contains_key(DIAG_UNMAPPED_PROVIDERS));
}

#[test]
fn unlinked_provider_is_reported_on_every_snapshot() {
    let store = Store::open_in_memory().unwrap();
    store.ingest(&message_event("mystery_vendor", "work")).unwrap();

    let out = ReadModel::new(&store).apply(
        &base_map("claude_code", "work"),
        &ReadModelOptions::default(),
    );
    let snapshot = &out["claude_code"];
    assert_eq!(
        snapshot.diagnostics.get(DIAG_UNMAPPED_PROVIDERS).map(String::as_str),
        Some("mystery_vendor")
    );
}

#[test]
fn root_hydration_replaces_base_quota() {
    let store = Store::open_in_memory().unwrap();

    let mut polled = UsageSnapshot::new("claude_code", "work");
    polled.timestamp = Some(Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 15).unwrap());
    polled.status = "ok".to_string();
    polled.message = "within limits".to_string();
    polled
        .metrics
        .insert("credit_balance".to_string(), Metric::used(42.5));
    let mut snapshots = BTreeMap::new();
    snapshots.insert("work".to_string(), polled);
    ingest_usage_snapshots(&store, &snapshots).unwrap();

    let mut base = base_map("claude_code", "work");
    base.get_mut("claude_code")
        .unwrap()
        .metrics
        .insert("credit_balance".to_string(), Metric::used(7.92));

    let out = ReadModel::new(&store).apply(&base, &ReadModelOptions::default());
    let snapshot = &out["claude_code"];

    // The stored limit snapshot is the source of truth.
    assert_eq!(snapshot.metrics["credit_balance"].used, Some(42.5));
    assert_eq!(snapshot.message, "within limits");
    assert_eq!(
        snapshot.attributes.get(ATTR_TELEMETRY_ROOT).map(String::as_str),
        Some("limit_snapshot")
    );
    assert_eq!(
        snapshot.timestamp,
        Some(Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 15).unwrap())
    );
}

#[test]
fn latest_limit_snapshot_wins() {
    let store = Store::open_in_memory().unwrap();

    for (seconds, balance) in [(15, 40.0), (45, 38.5)] {
        let mut polled = UsageSnapshot::new("claude_code", "work");
        polled.timestamp = Some(Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, seconds).unwrap());
        polled
            .metrics
            .insert("credit_balance".to_string(), Metric::used(balance));
        let mut snapshots = BTreeMap::new();
        snapshots.insert("work".to_string(), polled);
        ingest_usage_snapshots(&store, &snapshots).unwrap();
    }

    let out = ReadModel::new(&store).apply(
        &base_map("claude_code", "work"),
        &ReadModelOptions::default(),
    );
    assert_eq!(
        out["claude_code"].metrics["credit_balance"].used,
        Some(38.5)
    );
}

#[test]
fn inputs_are_never_mutated() {
    let store = Store::open_in_memory().unwrap();
    store.ingest(&message_event("claude_code", "work")).unwrap();

    let base = base_map("claude_code", "work");
    let before = base.clone();
    let _ = ReadModel::new(&store).apply(&base, &ReadModelOptions::default());
    assert_eq!(base, before);
}
