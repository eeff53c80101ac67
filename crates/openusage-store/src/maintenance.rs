use chrono::{Duration, Utc};
use tracing::info;

use openusage_types::format_store_time;

use crate::db::Store;
use crate::queries::usage::{LOGICAL_EVENT_ID_EXPR, QUALITY_SCORE_EXPR, SOURCE_PRIORITY_EXPR};
use crate::{Error, Result};

/// Rows removed by `compact_usage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub removed_events: usize,
    pub removed_raw: usize,
}

impl Store {
    /// Delete canonical events older than `retention_days`. Zero or a
    /// negative value keeps everything.
    pub fn prune_events(&self, retention_days: i64) -> Result<usize> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = format_store_time(Utc::now() - Duration::days(retention_days));
        let removed = self.with_writer(|conn| {
            conn.execute("DELETE FROM usage_events WHERE occurred_at < ?1", [&cutoff])
                .map_err(Error::from)
        })?;
        if removed > 0 {
            info!(removed, retention_days, "pruned expired canonical events");
        }
        Ok(removed)
    }

    /// Delete up to `limit` raw audit rows no longer referenced by any
    /// canonical event.
    pub fn prune_orphan_raw_events(&self, limit: usize) -> Result<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let removed = self.with_writer(|conn| {
            conn.execute(
                r#"
                DELETE FROM usage_raw_events WHERE raw_event_id IN (
                    SELECT raw_event_id FROM usage_raw_events
                    WHERE raw_event_id NOT IN (SELECT raw_event_id FROM usage_events)
                    LIMIT ?1
                )
                "#,
                [limit as i64],
            )
            .map_err(Error::from)
        })?;
        if removed > 0 {
            info!(removed, "pruned orphan raw events");
        }
        Ok(removed)
    }

    /// Remove legacy duplicates: apply the read model's ranking window
    /// across the whole canonical table, keep rank 1 per logical event,
    /// delete the rest, then drop the raw rows the deletion orphaned. One
    /// transaction.
    pub fn compact_usage(&self) -> Result<CompactionStats> {
        let sql = format!(
            r#"
            WITH all_usage AS (
                SELECT e.event_id, e.occurred_at, e.session_id, e.turn_id,
                       e.message_id, e.tool_call_id, e.event_type, e.model_raw,
                       e.model_canonical, e.total_tokens, e.cost_usd,
                       e.provider_id, e.dedup_key,
                       r.source_system AS source_system,
                       r.source_channel AS source_channel
                FROM usage_events e
                JOIN usage_raw_events r ON r.raw_event_id = e.raw_event_id
            ),
            ranked_usage AS (
                SELECT event_id,
                       ROW_NUMBER() OVER (
                           PARTITION BY lower(source_system), lower(event_type),
                                        lower(COALESCE(session_id, '')), {logical_id}
                           ORDER BY {priority} DESC, {quality} DESC,
                                    occurred_at DESC, event_id DESC
                       ) AS dedup_rank
                FROM all_usage
            )
            DELETE FROM usage_events WHERE event_id IN (
                SELECT event_id FROM ranked_usage WHERE dedup_rank > 1
            )
            "#,
            logical_id = LOGICAL_EVENT_ID_EXPR,
            priority = SOURCE_PRIORITY_EXPR,
            quality = QUALITY_SCORE_EXPR,
        );

        let stats = self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let removed_events = tx.execute(&sql, [])?;
            let removed_raw = tx.execute(
                r#"
                DELETE FROM usage_raw_events
                WHERE raw_event_id NOT IN (SELECT raw_event_id FROM usage_events)
                "#,
                [],
            )?;
            tx.commit()?;
            Ok(CompactionStats {
                removed_events,
                removed_raw,
            })
        })?;

        if stats.removed_events > 0 || stats.removed_raw > 0 {
            info!(
                removed_events = stats.removed_events,
                removed_raw = stats.removed_raw,
                "compacted usage events"
            );
        }
        Ok(stats)
    }
}
