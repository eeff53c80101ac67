use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use openusage_types::{
    EventStatus, EventType, IngestRequest, SourceChannel, build_dedup_key, format_store_time,
    is_blank, normalize, parse_store_time,
};

use crate::db::Store;
use crate::records::{CanonicalEventRow, IngestOutcome, RawEventRow};
use crate::{Error, Result};

impl Store {
    /// Accept one request: always writes a raw audit row, then either
    /// creates the canonical event or enriches the existing one when the
    /// dedup key already exists. One transaction per request; any failure
    /// other than the dedup conflict rolls the whole arrival back.
    pub fn ingest(&self, request: &IngestRequest) -> Result<IngestOutcome> {
        let normalized = normalize(request, Utc::now());
        let payload = normalized.payload.storage_bytes()?;
        let payload_sha256 = format!("{:x}", Sha256::digest(&payload));
        let dedup_key = build_dedup_key(&normalized);
        let raw_event_id = Uuid::new_v4().to_string();
        let event_id = Uuid::new_v4().to_string();

        let raw_row = RawEventRow {
            raw_event_id: raw_event_id.clone(),
            ingested_at: Utc::now(),
            source_system: normalized.source_system.clone(),
            source_channel: normalized.source_channel,
            source_schema_version: normalized
                .source_schema_version
                .clone()
                .unwrap_or_else(|| "v1".to_string()),
            payload,
            payload_sha256,
            workspace_id: clean(&normalized.workspace_id),
            session_id: clean(&normalized.session_id),
        };

        self.with_writer(|conn| {
            let tx = conn.transaction()?;

            insert_raw_event(&tx, &raw_row)?;

            let row = request_to_row(&normalized, &event_id, &dedup_key, &raw_event_id);
            match insert_canonical_event(&tx, &row) {
                Ok(()) => {
                    tx.commit()?;
                    Ok(IngestOutcome {
                        event_id: event_id.clone(),
                        raw_event_id: raw_event_id.clone(),
                        deduped: false,
                    })
                }
                Err(err) if is_unique_violation(&err) => {
                    let (stored, stored_channel) = load_by_dedup_key(&tx, &dedup_key)?
                        .ok_or_else(|| {
                            Error::Query(format!(
                                "dedup conflict but no stored row for key {}",
                                dedup_key
                            ))
                        })?;
                    let merged = merge_canonical(
                        &stored,
                        stored_channel,
                        &normalized,
                        normalized.source_channel,
                    );
                    update_canonical_event(&tx, &merged)?;
                    tx.commit()?;
                    Ok(IngestOutcome {
                        event_id: stored.event_id,
                        raw_event_id: raw_event_id.clone(),
                        deduped: true,
                    })
                }
                Err(err) => Err(err.into()),
            }
        })
    }
}

/// Per-field merge applied when a duplicate dedup key arrives.
///
/// Override is decided once from channel priority (incoming beats stored
/// strictly). Every field then follows the same table: absent stored values
/// adopt the incoming value, present ones are replaced only under override
/// by a present incoming value. Status has two exceptions: a stored
/// `unknown` always loses, and override is only honored when the incoming
/// status is itself not `unknown`. `total_tokens` is never reduced.
pub(crate) fn merge_canonical(
    stored: &CanonicalEventRow,
    stored_channel: SourceChannel,
    incoming: &IngestRequest,
    incoming_channel: SourceChannel,
) -> CanonicalEventRow {
    let wins = incoming_channel.priority() > stored_channel.priority();

    CanonicalEventRow {
        event_id: stored.event_id.clone(),
        occurred_at: merge_time(stored.occurred_at, incoming.occurred_at, wins),
        provider_id: merge_text(&stored.provider_id, &incoming.provider_id, wins),
        agent_name: merge_text(&stored.agent_name, &incoming.agent_name, wins),
        account_id: merge_text(&stored.account_id, &incoming.account_id, wins),
        workspace_id: merge_text(&stored.workspace_id, &incoming.workspace_id, wins),
        session_id: merge_text(&stored.session_id, &incoming.session_id, wins),
        turn_id: merge_text(&stored.turn_id, &incoming.turn_id, wins),
        message_id: merge_text(&stored.message_id, &incoming.message_id, wins),
        tool_call_id: merge_text(&stored.tool_call_id, &incoming.tool_call_id, wins),
        event_type: stored.event_type,
        model_raw: merge_text(&stored.model_raw, &incoming.model_raw, wins),
        model_canonical: merge_text(&stored.model_canonical, &incoming.model_canonical, wins),
        model_lineage: merge_text(&stored.model_lineage, &incoming.model_lineage, wins),
        input_tokens: merge_i64(stored.input_tokens, incoming.input_tokens, wins),
        output_tokens: merge_i64(stored.output_tokens, incoming.output_tokens, wins),
        reasoning_tokens: merge_i64(stored.reasoning_tokens, incoming.reasoning_tokens, wins),
        cache_read_tokens: merge_i64(stored.cache_read_tokens, incoming.cache_read_tokens, wins),
        cache_write_tokens: merge_i64(stored.cache_write_tokens, incoming.cache_write_tokens, wins),
        total_tokens: merge_total(stored.total_tokens, incoming.total_tokens, wins),
        cost_usd: merge_f64(stored.cost_usd, incoming.cost_usd, wins),
        request_count: merge_i64(stored.request_count, incoming.request_count, wins),
        tool_name: merge_text(&stored.tool_name, &incoming.tool_name, wins),
        status: merge_status(
            stored.status,
            incoming.status.unwrap_or(EventStatus::Ok),
            wins,
        ),
        dedup_key: stored.dedup_key.clone(),
        raw_event_id: stored.raw_event_id.clone(),
        normalization_version: merge_text(
            &Some(stored.normalization_version.clone()),
            &incoming.normalization_version,
            wins,
        )
        .unwrap_or_else(|| stored.normalization_version.clone()),
    }
}

fn merge_text(stored: &Option<String>, incoming: &Option<String>, wins: bool) -> Option<String> {
    if is_blank(stored) {
        return incoming.clone();
    }
    if wins && !is_blank(incoming) {
        return incoming.clone();
    }
    stored.clone()
}

fn merge_i64(stored: Option<i64>, incoming: Option<i64>, wins: bool) -> Option<i64> {
    match (stored, incoming) {
        (None, _) => incoming,
        (Some(_), Some(_)) if wins => incoming,
        _ => stored,
    }
}

fn merge_f64(stored: Option<f64>, incoming: Option<f64>, wins: bool) -> Option<f64> {
    match (stored, incoming) {
        (None, _) => incoming,
        (Some(_), Some(_)) if wins => incoming,
        _ => stored,
    }
}

fn merge_total(stored: Option<i64>, incoming: Option<i64>, wins: bool) -> Option<i64> {
    match (stored, incoming) {
        (None, _) => incoming,
        (Some(current), Some(candidate)) if wins && candidate >= current => incoming,
        _ => stored,
    }
}

fn merge_time(
    stored: DateTime<Utc>,
    incoming: Option<DateTime<Utc>>,
    wins: bool,
) -> DateTime<Utc> {
    match incoming {
        Some(ts) if wins => ts,
        _ => stored,
    }
}

fn merge_status(stored: EventStatus, incoming: EventStatus, wins: bool) -> EventStatus {
    if stored == EventStatus::Unknown {
        return incoming;
    }
    if wins && incoming != EventStatus::Unknown {
        return incoming;
    }
    stored
}

fn request_to_row(
    normalized: &IngestRequest,
    event_id: &str,
    dedup_key: &str,
    raw_event_id: &str,
) -> CanonicalEventRow {
    CanonicalEventRow {
        event_id: event_id.to_string(),
        occurred_at: normalized.occurred_at.unwrap_or_else(Utc::now),
        provider_id: clean(&normalized.provider_id),
        agent_name: clean(&normalized.agent_name),
        account_id: clean(&normalized.account_id),
        workspace_id: clean(&normalized.workspace_id),
        session_id: clean(&normalized.session_id),
        turn_id: clean(&normalized.turn_id),
        message_id: clean(&normalized.message_id),
        tool_call_id: clean(&normalized.tool_call_id),
        event_type: normalized.event_type.unwrap_or(EventType::MessageUsage),
        model_raw: clean(&normalized.model_raw),
        model_canonical: clean(&normalized.model_canonical),
        model_lineage: clean(&normalized.model_lineage),
        input_tokens: normalized.input_tokens,
        output_tokens: normalized.output_tokens,
        reasoning_tokens: normalized.reasoning_tokens,
        cache_read_tokens: normalized.cache_read_tokens,
        cache_write_tokens: normalized.cache_write_tokens,
        total_tokens: normalized.total_tokens,
        cost_usd: normalized.cost_usd,
        request_count: normalized.request_count,
        tool_name: clean(&normalized.tool_name),
        status: normalized.status.unwrap_or(EventStatus::Ok),
        dedup_key: dedup_key.to_string(),
        raw_event_id: raw_event_id.to_string(),
        normalization_version: normalized
            .normalization_version
            .clone()
            .unwrap_or_else(|| "v1".to_string()),
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value.clone().filter(|s| !s.trim().is_empty())
}

fn insert_raw_event(conn: &Connection, row: &RawEventRow) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO usage_raw_events (
            raw_event_id, ingested_at, source_system, source_channel,
            source_schema_version, payload, payload_sha256, workspace_id, session_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            &row.raw_event_id,
            format_store_time(row.ingested_at),
            &row.source_system,
            row.source_channel.as_str(),
            &row.source_schema_version,
            &row.payload,
            &row.payload_sha256,
            &row.workspace_id,
            &row.session_id,
        ],
    )?;
    Ok(())
}

fn insert_canonical_event(conn: &Connection, row: &CanonicalEventRow) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO usage_events (
            event_id, occurred_at, provider_id, agent_name, account_id,
            workspace_id, session_id, turn_id, message_id, tool_call_id,
            event_type, model_raw, model_canonical, model_lineage,
            input_tokens, output_tokens, reasoning_tokens, cache_read_tokens,
            cache_write_tokens, total_tokens, cost_usd, request_count,
            tool_name, status, dedup_key, raw_event_id, normalization_version
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
            ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
        )
        "#,
        params![
            &row.event_id,
            format_store_time(row.occurred_at),
            &row.provider_id,
            &row.agent_name,
            &row.account_id,
            &row.workspace_id,
            &row.session_id,
            &row.turn_id,
            &row.message_id,
            &row.tool_call_id,
            row.event_type.as_str(),
            &row.model_raw,
            &row.model_canonical,
            &row.model_lineage,
            row.input_tokens,
            row.output_tokens,
            row.reasoning_tokens,
            row.cache_read_tokens,
            row.cache_write_tokens,
            row.total_tokens,
            row.cost_usd,
            row.request_count,
            &row.tool_name,
            row.status.as_str(),
            &row.dedup_key,
            &row.raw_event_id,
            &row.normalization_version,
        ],
    )?;
    Ok(())
}

fn update_canonical_event(conn: &Connection, row: &CanonicalEventRow) -> Result<()> {
    conn.execute(
        r#"
        UPDATE usage_events SET
            occurred_at = ?2, provider_id = ?3, agent_name = ?4, account_id = ?5,
            workspace_id = ?6, session_id = ?7, turn_id = ?8, message_id = ?9,
            tool_call_id = ?10, model_raw = ?11, model_canonical = ?12,
            model_lineage = ?13, input_tokens = ?14, output_tokens = ?15,
            reasoning_tokens = ?16, cache_read_tokens = ?17, cache_write_tokens = ?18,
            total_tokens = ?19, cost_usd = ?20, request_count = ?21, tool_name = ?22,
            status = ?23, normalization_version = ?24
        WHERE event_id = ?1
        "#,
        params![
            &row.event_id,
            format_store_time(row.occurred_at),
            &row.provider_id,
            &row.agent_name,
            &row.account_id,
            &row.workspace_id,
            &row.session_id,
            &row.turn_id,
            &row.message_id,
            &row.tool_call_id,
            &row.model_raw,
            &row.model_canonical,
            &row.model_lineage,
            row.input_tokens,
            row.output_tokens,
            row.reasoning_tokens,
            row.cache_read_tokens,
            row.cache_write_tokens,
            row.total_tokens,
            row.cost_usd,
            row.request_count,
            &row.tool_name,
            row.status.as_str(),
            &row.normalization_version,
        ],
    )?;
    Ok(())
}

fn load_by_dedup_key(
    conn: &Connection,
    dedup_key: &str,
) -> Result<Option<(CanonicalEventRow, SourceChannel)>> {
    let result = conn
        .query_row(
            r#"
            SELECT e.event_id, e.occurred_at, e.provider_id, e.agent_name,
                   e.account_id, e.workspace_id, e.session_id, e.turn_id,
                   e.message_id, e.tool_call_id, e.event_type, e.model_raw,
                   e.model_canonical, e.model_lineage, e.input_tokens,
                   e.output_tokens, e.reasoning_tokens, e.cache_read_tokens,
                   e.cache_write_tokens, e.total_tokens, e.cost_usd,
                   e.request_count, e.tool_name, e.status, e.dedup_key,
                   e.raw_event_id, e.normalization_version, r.source_channel
            FROM usage_events e
            JOIN usage_raw_events r ON r.raw_event_id = e.raw_event_id
            WHERE e.dedup_key = ?1
            "#,
            [dedup_key],
            |row| {
                let occurred_at: String = row.get(1)?;
                let event_type: String = row.get(10)?;
                let status: String = row.get(23)?;
                let channel: String = row.get(27)?;
                Ok((
                    CanonicalEventRow {
                        event_id: row.get(0)?,
                        occurred_at: parse_timestamp(1, &occurred_at)?,
                        provider_id: row.get(2)?,
                        agent_name: row.get(3)?,
                        account_id: row.get(4)?,
                        workspace_id: row.get(5)?,
                        session_id: row.get(6)?,
                        turn_id: row.get(7)?,
                        message_id: row.get(8)?,
                        tool_call_id: row.get(9)?,
                        event_type: parse_event_type(10, &event_type)?,
                        model_raw: row.get(11)?,
                        model_canonical: row.get(12)?,
                        model_lineage: row.get(13)?,
                        input_tokens: row.get(14)?,
                        output_tokens: row.get(15)?,
                        reasoning_tokens: row.get(16)?,
                        cache_read_tokens: row.get(17)?,
                        cache_write_tokens: row.get(18)?,
                        total_tokens: row.get(19)?,
                        cost_usd: row.get(20)?,
                        request_count: row.get(21)?,
                        tool_name: row.get(22)?,
                        status: EventStatus::parse(&status),
                        dedup_key: row.get(24)?,
                        raw_event_id: row.get(25)?,
                        normalization_version: row.get(26)?,
                    },
                    SourceChannel::parse(&channel),
                ))
            },
        )
        .optional()?;

    Ok(result)
}

fn parse_timestamp(index: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_store_time(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {}", value).into(),
        )
    })
}

fn parse_event_type(index: usize, value: &str) -> rusqlite::Result<EventType> {
    EventType::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("invalid event type: {}", value).into(),
        )
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
