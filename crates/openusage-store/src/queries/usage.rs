use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;

use openusage_types::{format_store_time, parse_store_time};

use crate::db::Store;
use crate::{Error, Result};

/// Provider scope of a read-model query. `providers` holds the lowercased
/// provider ids that map onto one snapshot (the provider itself plus any
/// linked sources). Account scope narrows further when set.
#[derive(Debug, Clone, Default)]
pub struct UsageScope {
    pub providers: Vec<String>,
    pub account_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelUsageRow {
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub requests: i64,
    pub requests_today: i64,
}

/// Per-source or per-client rollup, depending on the grouping key used.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionUsageRow {
    pub key: String,
    pub requests: i64,
    pub tokens: i64,
    pub sessions: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUsageRow {
    pub tool: String,
    pub calls: i64,
    pub calls_today: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderUsageRow {
    pub provider: String,
    pub cost_usd: f64,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyTotalRow {
    pub day: String,
    pub cost_usd: f64,
    pub requests: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyDimensionRow {
    pub day: String,
    pub key: String,
    pub requests: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSummary {
    pub event_count: i64,
    pub last_event_at: Option<DateTime<Utc>>,
}

// NOTE: Query-time deduplication contract
//
// The store cannot be assumed duplicate-free: fallback-keyed arrivals and
// legacy rows may alias the same logical event under different dedup keys.
// Every aggregation therefore runs over the deduped_usage CTE, which keeps
// exactly one row per (source system, event type, session, logical event
// id) window ordered by source priority DESC, quality DESC, occurred_at
// DESC, event_id DESC. Compaction (maintenance.rs) applies the identical
// ranking destructively; the two must stay in lockstep.

pub(crate) const LOGICAL_EVENT_ID_EXPR: &str = r#"CASE
            WHEN COALESCE(tool_call_id, '') != '' THEN 'tool:' || lower(tool_call_id)
            WHEN COALESCE(message_id, '') != '' THEN 'message:' || lower(message_id)
            WHEN COALESCE(turn_id, '') != '' THEN 'turn:' || lower(turn_id)
            ELSE 'fallback:' || dedup_key
        END"#;

pub(crate) const SOURCE_PRIORITY_EXPR: &str = r#"CASE lower(source_channel)
            WHEN 'hook' THEN 4
            WHEN 'sse' THEN 3
            WHEN 'sqlite' THEN 2
            WHEN 'jsonl' THEN 2
            WHEN 'api' THEN 1
            ELSE 0
        END"#;

pub(crate) const QUALITY_SCORE_EXPR: &str = r#"(CASE WHEN COALESCE(total_tokens, 0) > 0 THEN 4 ELSE 0 END
            + CASE WHEN COALESCE(cost_usd, 0.0) > 0.0 THEN 2 ELSE 0 END
            + CASE WHEN COALESCE(model_canonical, '') != '' OR COALESCE(model_raw, '') != '' THEN 1 ELSE 0 END
            + CASE WHEN lower(COALESCE(provider_id, '')) NOT IN ('', 'unknown', 'opencode') THEN 1 ELSE 0 END)"#;

/// Deduped-usage CTE scoped to the provider set. Returns the SQL prefix
/// and its positional parameters; aggregations append their SELECT.
fn deduped_cte(scope: &UsageScope) -> (String, Vec<String>) {
    let mut params: Vec<String> = scope
        .providers
        .iter()
        .map(|p| p.trim().to_lowercase())
        .collect();
    let placeholders = (1..=params.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    let mut filters = format!("AND lower(COALESCE(e.provider_id, '')) IN ({})", placeholders);
    if let Some(account_id) = &scope.account_id {
        params.push(account_id.trim().to_lowercase());
        filters.push_str(&format!(
            " AND lower(COALESCE(e.account_id, '')) = ?{}",
            params.len()
        ));
    }
    if let Some(since) = scope.since {
        params.push(format_store_time(since));
        filters.push_str(&format!(" AND e.occurred_at >= ?{}", params.len()));
    }

    let sql = format!(
        r#"
        WITH scoped_usage AS (
            SELECT e.event_id, e.occurred_at, e.provider_id, e.agent_name,
                   e.account_id, e.workspace_id, e.session_id, e.turn_id,
                   e.message_id, e.tool_call_id, e.event_type, e.model_raw,
                   e.model_canonical, e.input_tokens, e.output_tokens,
                   e.reasoning_tokens, e.cache_read_tokens, e.cache_write_tokens,
                   e.total_tokens, e.cost_usd, e.request_count, e.tool_name,
                   e.status, e.dedup_key,
                   r.source_system AS source_system,
                   r.source_channel AS source_channel
            FROM usage_events e
            JOIN usage_raw_events r ON r.raw_event_id = e.raw_event_id
            WHERE e.event_type IN ('message_usage', 'tool_usage')
              {filters}
        ),
        annotated_usage AS (
            SELECT scoped_usage.*,
                   {logical_id} AS logical_event_id,
                   {priority} AS source_priority,
                   {quality} AS quality_score
            FROM scoped_usage
        ),
        deduped_usage AS (
            SELECT * FROM (
                SELECT annotated_usage.*,
                       ROW_NUMBER() OVER (
                           PARTITION BY lower(source_system), lower(event_type),
                                        lower(COALESCE(session_id, '')), logical_event_id
                           ORDER BY source_priority DESC, quality_score DESC,
                                    occurred_at DESC, event_id DESC
                       ) AS dedup_rank
                FROM annotated_usage
            ) WHERE dedup_rank = 1
        )
        "#,
        filters = filters,
        logical_id = LOGICAL_EVENT_ID_EXPR,
        priority = SOURCE_PRIORITY_EXPR,
        quality = QUALITY_SCORE_EXPR,
    );

    (sql, params)
}

impl Store {
    /// Per-model sums over deduped message usage, error rows excluded.
    pub fn model_rollup(&self, scope: &UsageScope) -> Result<Vec<ModelUsageRow>> {
        if scope.providers.is_empty() {
            return Ok(Vec::new());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT COALESCE(model_canonical, model_raw, 'unknown') AS model,
                   SUM(COALESCE(input_tokens, 0)),
                   SUM(COALESCE(output_tokens, 0)),
                   SUM(COALESCE(cache_read_tokens, 0) + COALESCE(cache_write_tokens, 0)),
                   SUM(COALESCE(reasoning_tokens, 0)),
                   SUM(COALESCE(total_tokens, 0)),
                   SUM(COALESCE(cost_usd, 0.0)),
                   SUM(COALESCE(request_count, 1)),
                   SUM(CASE WHEN substr(occurred_at, 1, 10) = strftime('%Y-%m-%d', 'now')
                            THEN COALESCE(request_count, 1) ELSE 0 END)
            FROM deduped_usage
            WHERE event_type = 'message_usage' AND status != 'error'
            GROUP BY model
            ORDER BY model
            "#
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(ModelUsageRow {
                        model: row.get(0)?,
                        input_tokens: row.get(1)?,
                        output_tokens: row.get(2)?,
                        cached_tokens: row.get(3)?,
                        reasoning_tokens: row.get(4)?,
                        total_tokens: row.get(5)?,
                        cost_usd: row.get(6)?,
                        requests: row.get(7)?,
                        requests_today: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Per-source sums over deduped message usage. The source dimension is
    /// the workspace when known, else the source system.
    pub fn source_rollup(&self, scope: &UsageScope) -> Result<Vec<DimensionUsageRow>> {
        self.dimension_rollup(scope, "COALESCE(workspace_id, source_system)")
    }

    /// Per-client sums over deduped message usage, keyed by source system.
    pub fn client_rollup(&self, scope: &UsageScope) -> Result<Vec<DimensionUsageRow>> {
        self.dimension_rollup(scope, "source_system")
    }

    fn dimension_rollup(
        &self,
        scope: &UsageScope,
        key_expr: &str,
    ) -> Result<Vec<DimensionUsageRow>> {
        if scope.providers.is_empty() {
            return Ok(Vec::new());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT {key_expr} AS dim,
                   SUM(COALESCE(request_count, 1)),
                   SUM(COALESCE(total_tokens, 0)),
                   COUNT(DISTINCT lower(session_id))
            FROM deduped_usage
            WHERE event_type = 'message_usage'
            GROUP BY dim
            ORDER BY dim
            "#
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(DimensionUsageRow {
                        key: row.get(0)?,
                        requests: row.get(1)?,
                        tokens: row.get(2)?,
                        sessions: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Call counts per lowercased tool name over deduped tool usage.
    pub fn tool_rollup(&self, scope: &UsageScope) -> Result<Vec<ToolUsageRow>> {
        if scope.providers.is_empty() {
            return Ok(Vec::new());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT COALESCE(NULLIF(lower(tool_name), ''), 'unknown') AS tool,
                   COUNT(*),
                   SUM(CASE WHEN substr(occurred_at, 1, 10) = strftime('%Y-%m-%d', 'now')
                            THEN 1 ELSE 0 END)
            FROM deduped_usage
            WHERE event_type = 'tool_usage'
            GROUP BY tool
            ORDER BY tool
            "#
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(ToolUsageRow {
                        tool: row.get(0)?,
                        calls: row.get(1)?,
                        calls_today: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Per-provider sums over deduped message usage, error rows excluded.
    pub fn provider_rollup(&self, scope: &UsageScope) -> Result<Vec<ProviderUsageRow>> {
        if scope.providers.is_empty() {
            return Ok(Vec::new());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT COALESCE(NULLIF(lower(provider_id), ''), 'unknown') AS provider,
                   SUM(COALESCE(cost_usd, 0.0)),
                   SUM(COALESCE(request_count, 1)),
                   SUM(COALESCE(input_tokens, 0)),
                   SUM(COALESCE(output_tokens, 0))
            FROM deduped_usage
            WHERE event_type = 'message_usage' AND status != 'error'
            GROUP BY provider
            ORDER BY provider
            "#
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(ProviderUsageRow {
                        provider: row.get(0)?,
                        cost_usd: row.get(1)?,
                        requests: row.get(2)?,
                        input_tokens: row.get(3)?,
                        output_tokens: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Cost/request/token totals per UTC day over the last 30 days,
    /// oldest day first.
    pub fn daily_totals(&self, scope: &UsageScope) -> Result<Vec<DailyTotalRow>> {
        if scope.providers.is_empty() {
            return Ok(Vec::new());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT substr(occurred_at, 1, 10) AS day,
                   SUM(COALESCE(cost_usd, 0.0)),
                   SUM(COALESCE(request_count, 1)),
                   SUM(COALESCE(total_tokens, 0))
            FROM deduped_usage
            WHERE event_type = 'message_usage' AND status != 'error'
              AND substr(occurred_at, 1, 10) >= date('now', '-29 day')
            GROUP BY day
            ORDER BY day
            "#
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(DailyTotalRow {
                        day: row.get(0)?,
                        cost_usd: row.get(1)?,
                        requests: row.get(2)?,
                        tokens: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Daily request counts per model over the last 30 days.
    pub fn daily_by_model(&self, scope: &UsageScope) -> Result<Vec<DailyDimensionRow>> {
        self.daily_by_dimension(scope, "COALESCE(model_canonical, model_raw, 'unknown')")
    }

    /// Daily request counts per source dimension over the last 30 days.
    pub fn daily_by_source(&self, scope: &UsageScope) -> Result<Vec<DailyDimensionRow>> {
        self.daily_by_dimension(scope, "COALESCE(workspace_id, source_system)")
    }

    /// Daily request and token counts per client over the last 30 days.
    pub fn daily_by_client(&self, scope: &UsageScope) -> Result<Vec<DailyDimensionRow>> {
        self.daily_by_dimension(scope, "source_system")
    }

    fn daily_by_dimension(
        &self,
        scope: &UsageScope,
        key_expr: &str,
    ) -> Result<Vec<DailyDimensionRow>> {
        if scope.providers.is_empty() {
            return Ok(Vec::new());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT substr(occurred_at, 1, 10) AS day,
                   {key_expr} AS dim,
                   SUM(COALESCE(request_count, 1)),
                   SUM(COALESCE(total_tokens, 0))
            FROM deduped_usage
            WHERE event_type = 'message_usage' AND status != 'error'
              AND substr(occurred_at, 1, 10) >= date('now', '-29 day')
            GROUP BY day, dim
            ORDER BY day, dim
            "#
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok(DailyDimensionRow {
                        day: row.get(0)?,
                        key: row.get(1)?,
                        requests: row.get(2)?,
                        tokens: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Deduped event count and most recent occurred_at in scope.
    pub fn usage_summary(&self, scope: &UsageScope) -> Result<UsageSummary> {
        if scope.providers.is_empty() {
            return Ok(UsageSummary::default());
        }
        let (cte, params) = deduped_cte(scope);
        let sql = format!(
            r#"{cte}
            SELECT COUNT(*), MAX(occurred_at) FROM deduped_usage
            "#
        );
        self.with_reader(|conn| {
            let (event_count, last): (i64, Option<String>) =
                conn.query_row(&sql, params_from_iter(params.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
            let last_event_at = match last {
                None => None,
                Some(text) => Some(
                    parse_store_time(&text)
                        .ok_or_else(|| Error::Query(format!("invalid stored timestamp: {}", text)))?,
                ),
            };
            Ok(UsageSummary {
                event_count,
                last_event_at,
            })
        })
    }
}
