use std::collections::BTreeMap;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::warn;

use openusage_store::{Store, UsageScope};
use openusage_types::{DailyPoint, Metric, UsageSnapshot, sanitize_metric_id};

/// Metric families owned by the overlay: purged from the base before
/// telemetry values are written (telemetry overrides).
const METRIC_PREFIXES: [&str; 5] = ["model_", "source_", "client_", "tool_", "provider_"];

/// Daily-series families owned by the overlay.
const SERIES_PREFIXES: [&str; 3] = ["usage_", "tokens_client_", "analytics_"];

/// Metric keys that may carry an authoritative total cost, probed in order.
const AUTHORITATIVE_COST_KEYS: [&str; 4] = [
    "credit_balance",
    "spend_limit",
    "plan_total_spend_usd",
    "credits",
];

const COST_EPSILON: f64 = 1e-6;

/// Overlay canonical usage onto one snapshot.
///
/// The provider set is the snapshot's own provider plus every linked
/// source whose target matches it. Snapshots without a provider id, and
/// snapshots with no canonical usage in scope, pass through unchanged. A
/// query failure also passes the snapshot through; the UI must not break
/// because telemetry is unavailable.
pub fn overlay_usage(
    store: &Store,
    snapshot: &UsageSnapshot,
    links: &BTreeMap<String, String>,
    window_since: Option<DateTime<Utc>>,
) -> UsageSnapshot {
    match try_overlay(store, snapshot, links, window_since) {
        Ok(out) => out,
        Err(err) => {
            warn!(
                provider = %snapshot.provider_id,
                error = %err,
                "usage overlay failed; passing snapshot through"
            );
            snapshot.clone()
        }
    }
}

fn try_overlay(
    store: &Store,
    snapshot: &UsageSnapshot,
    links: &BTreeMap<String, String>,
    window_since: Option<DateTime<Utc>>,
) -> openusage_store::Result<UsageSnapshot> {
    let mut out = snapshot.clone();

    let provider = snapshot.provider_id.trim().to_lowercase();
    if provider.is_empty() {
        return Ok(out);
    }

    let mut providers = vec![provider.clone()];
    for (source, target) in links {
        if *target == provider && *source != provider {
            providers.push(source.clone());
        }
    }

    let account_id = {
        let trimmed = snapshot.account_id.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };

    let scope = UsageScope {
        providers,
        account_id: account_id.clone(),
        since: window_since,
    };

    let summary = store.usage_summary(&scope)?;
    if summary.event_count == 0 {
        return Ok(out);
    }

    let models = store.model_rollup(&scope)?;
    let sources = store.source_rollup(&scope)?;
    let clients = store.client_rollup(&scope)?;
    let tools = store.tool_rollup(&scope)?;
    let provider_rows = store.provider_rollup(&scope)?;
    let daily = store.daily_totals(&scope)?;
    let daily_models = store.daily_by_model(&scope)?;
    let daily_sources = store.daily_by_source(&scope)?;
    let daily_clients = store.daily_by_client(&scope)?;

    out.metrics
        .retain(|name, _| !METRIC_PREFIXES.iter().any(|prefix| name.starts_with(prefix)));
    out.daily_series
        .retain(|name, _| !SERIES_PREFIXES.iter().any(|prefix| name.starts_with(prefix)));

    for row in &models {
        let id = sanitize_metric_id(&row.model);
        let set = |out: &mut UsageSnapshot, suffix: &str, value: f64| {
            out.metrics
                .insert(format!("model_{}_{}", id, suffix), Metric::used(value));
        };
        set(&mut out, "input_tokens", row.input_tokens as f64);
        set(&mut out, "output_tokens", row.output_tokens as f64);
        set(&mut out, "cached_tokens", row.cached_tokens as f64);
        set(&mut out, "reasoning_tokens", row.reasoning_tokens as f64);
        set(&mut out, "cost_usd", row.cost_usd);
        set(&mut out, "requests", row.requests as f64);
        set(&mut out, "requests_today", row.requests_today as f64);
    }

    for (family, rows) in [("source", &sources), ("client", &clients)] {
        for row in rows {
            let id = sanitize_metric_id(&row.key);
            out.metrics.insert(
                format!("{}_{}_requests", family, id),
                Metric::used(row.requests as f64),
            );
            out.metrics.insert(
                format!("{}_{}_tokens", family, id),
                Metric::used(row.tokens as f64),
            );
            out.metrics.insert(
                format!("{}_{}_sessions", family, id),
                Metric::used(row.sessions as f64),
            );
        }
    }

    for row in &tools {
        let id = sanitize_metric_id(&row.tool);
        out.metrics
            .insert(format!("tool_{}", id), Metric::used(row.calls as f64));
        out.metrics.insert(
            format!("tool_{}_today", id),
            Metric::used(row.calls_today as f64),
        );
    }

    for row in &provider_rows {
        let id = sanitize_metric_id(&row.provider);
        out.metrics.insert(
            format!("provider_{}_cost_usd", id),
            Metric::used(row.cost_usd),
        );
        out.metrics.insert(
            format!("provider_{}_requests", id),
            Metric::used(row.requests as f64),
        );
        out.metrics.insert(
            format!("provider_{}_input_tokens", id),
            Metric::used(row.input_tokens as f64),
        );
        out.metrics.insert(
            format!("provider_{}_output_tokens", id),
            Metric::used(row.output_tokens as f64),
        );
    }

    if !daily.is_empty() {
        let point = |value: f64, day: &str| DailyPoint {
            date: day.to_string(),
            value,
        };
        out.daily_series.insert(
            "analytics_cost".to_string(),
            daily.iter().map(|r| point(r.cost_usd, &r.day)).collect(),
        );
        out.daily_series.insert(
            "analytics_requests".to_string(),
            daily
                .iter()
                .map(|r| point(r.requests as f64, &r.day))
                .collect(),
        );
        out.daily_series.insert(
            "analytics_tokens".to_string(),
            daily.iter().map(|r| point(r.tokens as f64, &r.day)).collect(),
        );
    }

    let mut usage_series: BTreeMap<String, Vec<DailyPoint>> = BTreeMap::new();
    for row in &daily_models {
        usage_series
            .entry(format!("usage_model_{}", sanitize_metric_id(&row.key)))
            .or_default()
            .push(DailyPoint {
                date: row.day.clone(),
                value: row.requests as f64,
            });
    }
    for row in &daily_sources {
        usage_series
            .entry(format!("usage_source_{}", sanitize_metric_id(&row.key)))
            .or_default()
            .push(DailyPoint {
                date: row.day.clone(),
                value: row.requests as f64,
            });
    }
    for row in &daily_clients {
        let id = sanitize_metric_id(&row.key);
        usage_series
            .entry(format!("usage_client_{}", id))
            .or_default()
            .push(DailyPoint {
                date: row.day.clone(),
                value: row.requests as f64,
            });
        usage_series
            .entry(format!("tokens_client_{}", id))
            .or_default()
            .push(DailyPoint {
                date: row.day.clone(),
                value: row.tokens as f64,
            });
    }
    out.daily_series.extend(usage_series);

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let week_start = (Utc::now() - Duration::days(6)).format("%Y-%m-%d").to_string();
    let today_cost: f64 = daily
        .iter()
        .filter(|r| r.day == today)
        .map(|r| r.cost_usd)
        .sum();
    let week_cost: f64 = daily
        .iter()
        .filter(|r| r.day.as_str() >= week_start.as_str())
        .map(|r| r.cost_usd)
        .sum();
    let month_cost: f64 = daily.iter().map(|r| r.cost_usd).sum();
    if today_cost > 0.0 {
        out.metrics
            .insert("today_cost".to_string(), Metric::used(today_cost));
        out.metrics
            .insert("usage_daily".to_string(), Metric::used(today_cost));
    }
    if week_cost > 0.0 {
        out.metrics
            .insert("7d_api_cost".to_string(), Metric::used(week_cost));
        out.metrics
            .insert("usage_weekly".to_string(), Metric::used(week_cost));
    }
    if month_cost > 0.0 {
        out.metrics
            .insert("analytics_30d_cost".to_string(), Metric::used(month_cost));
    }

    let authoritative_cost = AUTHORITATIVE_COST_KEYS
        .iter()
        .find_map(|key| out.metrics.get(*key).and_then(|m| m.used).filter(|v| *v != 0.0));
    if let Some(authoritative) = authoritative_cost {
        let model_cost: f64 = models.iter().map(|r| r.cost_usd).sum();
        let model_delta = authoritative - model_cost;
        if model_delta > COST_EPSILON {
            out.metrics.insert(
                "model_unattributed_cost_usd".to_string(),
                Metric::used(model_delta),
            );
            out.diagnostics.insert(
                "telemetry_unattributed_model_cost_usd".to_string(),
                format!("{:.6}", model_delta),
            );
        }

        let provider_cost: f64 = provider_rows.iter().map(|r| r.cost_usd).sum();
        let provider_delta = authoritative - provider_cost;
        if provider_delta > COST_EPSILON {
            out.metrics.insert(
                "provider_unattributed_cost_usd".to_string(),
                Metric::used(provider_delta),
            );
            out.diagnostics.insert(
                "telemetry_unattributed_provider_cost_usd".to_string(),
                format!("{:.6}", provider_delta),
            );
        }
    }

    out.attributes
        .insert("telemetry_view".to_string(), "canonical".to_string());
    out.attributes.insert(
        "telemetry_source_of_truth".to_string(),
        "canonical_usage_events".to_string(),
    );
    if let Some(last_event_at) = summary.last_event_at {
        out.attributes.insert(
            "telemetry_last_event_at".to_string(),
            last_event_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }
    match &account_id {
        Some(account) => {
            out.attributes
                .insert("telemetry_scope".to_string(), "account".to_string());
            out.attributes
                .insert("telemetry_scope_account_id".to_string(), account.clone());
        }
        None => {
            out.attributes
                .insert("telemetry_scope".to_string(), "provider".to_string());
        }
    }
    out.diagnostics.insert(
        "telemetry_event_count".to_string(),
        summary.event_count.to_string(),
    );

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openusage_types::{IngestRequest, SourceChannel};

    fn ingest_message(store: &Store, provider: &str, account: &str, message_id: &str, cost: f64) {
        let mut request = IngestRequest::new("claude_code", SourceChannel::Hook);
        request.session_id = Some("s1".to_string());
        request.message_id = Some(message_id.to_string());
        request.provider_id = Some(provider.to_string());
        request.account_id = Some(account.to_string());
        request.model_raw = Some("Claude-Sonnet".to_string());
        request.input_tokens = Some(120);
        request.output_tokens = Some(40);
        request.cost_usd = Some(cost);
        store.ingest(&request).unwrap();
    }

    #[test]
    fn test_empty_provider_passes_through() {
        let store = Store::open_in_memory().unwrap();
        let base = UsageSnapshot::new("", "work");
        assert_eq!(
            overlay_usage(&store, &base, &BTreeMap::new(), None),
            base
        );
    }

    #[test]
    fn test_no_usage_passes_through() {
        let store = Store::open_in_memory().unwrap();
        let mut base = UsageSnapshot::new("claude_code", "work");
        base.metrics
            .insert("model_stale_requests".to_string(), Metric::used(9.0));

        // No events in scope, so even stale overlay families survive.
        let out = overlay_usage(&store, &base, &BTreeMap::new(), None);
        assert_eq!(out, base);
    }

    #[test]
    fn test_overlay_writes_model_source_and_window_metrics() {
        let store = Store::open_in_memory().unwrap();
        ingest_message(&store, "claude_code", "work", "m1", 0.012);

        let base = UsageSnapshot::new("claude_code", "work");
        let out = overlay_usage(&store, &base, &BTreeMap::new(), None);

        assert_eq!(
            out.metrics["model_claude_sonnet_input_tokens"].used,
            Some(120.0)
        );
        assert_eq!(out.metrics["model_claude_sonnet_requests"].used, Some(1.0));
        assert_eq!(out.metrics["source_claude_code_requests"].used, Some(1.0));
        assert_eq!(out.metrics["client_claude_code_tokens"].used, Some(160.0));
        assert_eq!(out.metrics["provider_claude_code_requests"].used, Some(1.0));

        // Derived windows from today's cost.
        assert!((out.metrics["today_cost"].used.unwrap() - 0.012).abs() < 1e-9);
        assert!((out.metrics["usage_weekly"].used.unwrap() - 0.012).abs() < 1e-9);
        assert!((out.metrics["analytics_30d_cost"].used.unwrap() - 0.012).abs() < 1e-9);

        assert_eq!(out.daily_series["analytics_requests"].len(), 1);
        assert_eq!(out.daily_series["usage_model_claude_sonnet"].len(), 1);
        assert_eq!(out.daily_series["tokens_client_claude_code"][0].value, 160.0);

        assert_eq!(
            out.attributes.get("telemetry_view").map(String::as_str),
            Some("canonical")
        );
        assert_eq!(
            out.attributes.get("telemetry_scope").map(String::as_str),
            Some("account")
        );
        assert_eq!(
            out.attributes
                .get("telemetry_scope_account_id")
                .map(String::as_str),
            Some("work")
        );
        assert_eq!(
            out.diagnostics
                .get("telemetry_event_count")
                .map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_stale_overlay_families_purged() {
        let store = Store::open_in_memory().unwrap();
        ingest_message(&store, "claude_code", "work", "m1", 0.0);

        let mut base = UsageSnapshot::new("claude_code", "work");
        base.metrics
            .insert("model_old_model_requests".to_string(), Metric::used(9.0));
        base.metrics
            .insert("tool_old_tool".to_string(), Metric::used(3.0));
        base.metrics
            .insert("credit_balance".to_string(), Metric::used(7.92));
        base.daily_series.insert(
            "usage_model_old_model".to_string(),
            vec![DailyPoint {
                date: "2026-01-01".to_string(),
                value: 1.0,
            }],
        );

        let out = overlay_usage(&store, &base, &BTreeMap::new(), None);
        assert!(!out.metrics.contains_key("model_old_model_requests"));
        assert!(!out.metrics.contains_key("tool_old_tool"));
        assert!(!out.daily_series.contains_key("usage_model_old_model"));
        // Quota families are not overlay-owned and survive.
        assert_eq!(out.metrics["credit_balance"].used, Some(7.92));
    }

    #[test]
    fn test_provider_links_fold_sources_in() {
        let store = Store::open_in_memory().unwrap();
        ingest_message(&store, "anthropic", "work", "m1", 0.0);

        let links: BTreeMap<String, String> =
            [("anthropic".to_string(), "claude_code".to_string())].into();
        let base = UsageSnapshot::new("claude_code", "work");
        let out = overlay_usage(&store, &base, &links, None);

        assert_eq!(
            out.metrics["model_claude_sonnet_input_tokens"].used,
            Some(120.0)
        );
    }

    #[test]
    fn test_unattributed_cost_reconciliation() {
        let store = Store::open_in_memory().unwrap();
        ingest_message(&store, "claude_code", "work", "m1", 0.012);

        let mut base = UsageSnapshot::new("claude_code", "work");
        base.metrics
            .insert("credit_balance".to_string(), Metric::used(7.92));

        let out = overlay_usage(&store, &base, &BTreeMap::new(), None);
        let delta = out.metrics["model_unattributed_cost_usd"].used.unwrap();
        assert!((delta - (7.92 - 0.012)).abs() < 1e-9);
        assert_eq!(
            out.diagnostics
                .get("telemetry_unattributed_model_cost_usd")
                .map(String::as_str),
            Some("7.908000")
        );
        assert!(out.metrics.contains_key("provider_unattributed_cost_usd"));
    }

    #[test]
    fn test_input_snapshot_not_mutated() {
        let store = Store::open_in_memory().unwrap();
        ingest_message(&store, "claude_code", "work", "m1", 0.012);

        let mut base = UsageSnapshot::new("claude_code", "work");
        base.metrics
            .insert("model_stale_requests".to_string(), Metric::used(9.0));
        let before = base.clone();

        let _ = overlay_usage(&store, &base, &BTreeMap::new(), None);
        assert_eq!(base, before);
    }
}
