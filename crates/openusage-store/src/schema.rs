use rusqlite::Connection;

use crate::Result;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

// NOTE: Storage Design
//
// Raw rows are the immutable audit trail: one row per arrival, payload
// bytes kept verbatim with a content hash. Canonical rows are the
// deduplicated facts: one row per logical event, keyed by the unique
// dedup_key, mutated only by the enrich protocol. Raw rows may outnumber
// canonical rows because every duplicate arrival still lands in the audit
// log. usage_reconciliation_windows is reserved for later reconciliation
// events and is not exercised by the core flow.

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS usage_raw_events (
            raw_event_id TEXT PRIMARY KEY,
            ingested_at TEXT NOT NULL,
            source_system TEXT NOT NULL,
            source_channel TEXT NOT NULL,
            source_schema_version TEXT NOT NULL,
            payload BLOB NOT NULL,
            payload_sha256 TEXT NOT NULL,
            workspace_id TEXT,
            session_id TEXT
        );

        CREATE TABLE IF NOT EXISTS usage_events (
            event_id TEXT PRIMARY KEY,
            occurred_at TEXT NOT NULL,
            provider_id TEXT,
            agent_name TEXT,
            account_id TEXT,
            workspace_id TEXT,
            session_id TEXT,
            turn_id TEXT,
            message_id TEXT,
            tool_call_id TEXT,
            event_type TEXT NOT NULL,
            model_raw TEXT,
            model_canonical TEXT,
            model_lineage TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            reasoning_tokens INTEGER,
            cache_read_tokens INTEGER,
            cache_write_tokens INTEGER,
            total_tokens INTEGER,
            cost_usd REAL,
            request_count INTEGER,
            tool_name TEXT,
            status TEXT NOT NULL,
            dedup_key TEXT NOT NULL UNIQUE,
            raw_event_id TEXT NOT NULL,
            normalization_version TEXT NOT NULL,
            FOREIGN KEY (raw_event_id) REFERENCES usage_raw_events(raw_event_id)
        );

        CREATE TABLE IF NOT EXISTS usage_reconciliation_windows (
            window_id TEXT PRIMARY KEY,
            provider_id TEXT NOT NULL,
            account_id TEXT,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            applied_at TEXT,
            details TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_raw_ingested_at
            ON usage_raw_events(ingested_at);
        CREATE INDEX IF NOT EXISTS idx_raw_source
            ON usage_raw_events(source_system, source_channel);
        CREATE INDEX IF NOT EXISTS idx_events_occurred_at
            ON usage_events(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_provider_account
            ON usage_events(provider_id, account_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_provider_account_type
            ON usage_events(provider_id, account_id, event_type, occurred_at DESC);
        CREATE INDEX IF NOT EXISTS idx_events_type_provider
            ON usage_events(event_type, provider_id);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

    Ok(())
}
