use tracing::warn;

use openusage_store::Store;
use openusage_types::{LimitSnapshotEnvelope, POLLER_SOURCE_SYSTEM, UsageSnapshot};

pub const ATTR_TELEMETRY_ROOT: &str = "telemetry_root";

/// Replace the snapshot root with the most recent stored `limit_snapshot`
/// for its provider/account.
///
/// The telemetry stream is the source of truth for quota figures: when a
/// stored snapshot exists, the base metrics, resets, attributes,
/// diagnostics, timestamp, status and message are all discarded in favor
/// of the stored ones. Without a stored snapshot the base passes through
/// untouched.
pub fn hydrate_root(store: &Store, snapshot: &UsageSnapshot) -> UsageSnapshot {
    let mut out = snapshot.clone();
    if snapshot.provider_id.trim().is_empty() || snapshot.account_id.trim().is_empty() {
        return out;
    }

    let row = match store.latest_limit_snapshot(
        &snapshot.provider_id,
        &snapshot.account_id,
        POLLER_SOURCE_SYSTEM,
    ) {
        Ok(Some(row)) => row,
        Ok(None) => return out,
        Err(err) => {
            warn!(
                provider = %snapshot.provider_id,
                account = %snapshot.account_id,
                error = %err,
                "limit snapshot lookup failed; keeping base root"
            );
            return out;
        }
    };

    let envelope: LimitSnapshotEnvelope = match serde_json::from_slice(&row.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                provider = %snapshot.provider_id,
                account = %snapshot.account_id,
                error = %err,
                "stored limit snapshot payload is malformed; keeping base root"
            );
            return out;
        }
    };

    out.metrics = envelope.metrics;
    out.resets = envelope.resets;
    out.attributes = envelope.attributes;
    out.diagnostics = envelope.diagnostics;
    out.timestamp = Some(row.occurred_at);
    out.status = envelope.status;
    out.message = envelope.message;
    out.attributes
        .insert(ATTR_TELEMETRY_ROOT.to_string(), "limit_snapshot".to_string());
    out
}
