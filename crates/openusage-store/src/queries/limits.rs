use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use openusage_types::parse_store_time;

use crate::db::Store;
use crate::{Error, Result};

/// Latest stored quota observation for one (provider, account) pair.
#[derive(Debug, Clone)]
pub struct LimitSnapshotRow {
    pub occurred_at: DateTime<Utc>,
    /// Envelope bytes of the raw arrival that created the canonical row.
    pub payload: Vec<u8>,
}

impl Store {
    /// Most recent `limit_snapshot` event for the given provider/account
    /// emitted by the given source system (the quota poller).
    pub fn latest_limit_snapshot(
        &self,
        provider_id: &str,
        account_id: &str,
        source_system: &str,
    ) -> Result<Option<LimitSnapshotRow>> {
        self.with_reader(|conn| {
            let result = conn
                .query_row(
                    r#"
                    SELECT e.occurred_at, r.payload
                    FROM usage_events e
                    JOIN usage_raw_events r ON r.raw_event_id = e.raw_event_id
                    WHERE e.event_type = 'limit_snapshot'
                      AND lower(COALESCE(e.provider_id, '')) = ?1
                      AND lower(COALESCE(e.account_id, '')) = ?2
                      AND lower(r.source_system) = ?3
                    ORDER BY e.occurred_at DESC
                    LIMIT 1
                    "#,
                    [
                        provider_id.trim().to_lowercase(),
                        account_id.trim().to_lowercase(),
                        source_system.trim().to_lowercase(),
                    ],
                    |row| {
                        let occurred_at: String = row.get(0)?;
                        let payload: Vec<u8> = row.get(1)?;
                        Ok((occurred_at, payload))
                    },
                )
                .optional()?;

            match result {
                None => Ok(None),
                Some((occurred_at, payload)) => {
                    let occurred_at = parse_store_time(&occurred_at).ok_or_else(|| {
                        Error::Query(format!("invalid stored timestamp: {}", occurred_at))
                    })?;
                    Ok(Some(LimitSnapshotRow {
                        occurred_at,
                        payload,
                    }))
                }
            }
        })
    }

    /// Distinct lowercased provider ids appearing in canonical usage
    /// (message and tool events only).
    pub fn distinct_usage_providers(&self) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT DISTINCT lower(provider_id)
                FROM usage_events
                WHERE event_type IN ('message_usage', 'tool_usage')
                  AND provider_id IS NOT NULL
                  AND provider_id != ''
                ORDER BY 1
                "#,
            )?;
            let providers = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(providers)
        })
    }
}
