use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use openusage_spool::{Spool, SpoolRecord};
use openusage_store::Store;
use openusage_types::IngestRequest;

/// Outcome of `enqueue_requests`: how many requests landed in the spool,
/// and the append error that stopped the batch early when one did.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub enqueued: usize,
    pub error: Option<anyhow::Error>,
}

/// Per-flush classification counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub processed: usize,
    pub ingested: usize,
    pub deduped: usize,
    pub failed: usize,
}

impl FlushResult {
    pub fn absorb(&mut self, other: FlushResult) {
        self.processed += other.processed;
        self.ingested += other.ingested;
        self.deduped += other.deduped;
        self.failed += other.failed;
    }

    /// A batch with neither ingests nor dedups made no forward progress;
    /// draining further would spin on the same stuck records.
    pub fn forward_progress(&self) -> bool {
        self.ingested + self.deduped > 0
    }
}

/// Marshals requests into the spool and drains the spool into the store.
///
/// The spool write happens before the store sees anything, so a crash
/// between enqueue and ingest replays the record on the next flush.
pub struct Pipeline {
    spool: Spool,
    store: Arc<Store>,
}

impl Pipeline {
    pub fn new(spool: Spool, store: Arc<Store>) -> Self {
        Self { spool, store }
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Serialize each request and append it to the spool. The first append
    /// error aborts the batch; the report carries the partial count.
    pub fn enqueue_requests(&self, requests: &[IngestRequest]) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        for request in requests {
            let payload = match serde_json::to_string(request) {
                Ok(payload) => payload,
                Err(err) => {
                    report.error =
                        Some(anyhow::Error::new(err).context("marshal request for spool"));
                    return report;
                }
            };
            let record =
                SpoolRecord::new(&request.source_system, request.source_channel, payload);
            match self.spool.append(&record) {
                Ok(_) => report.enqueued += 1,
                Err(err) => {
                    report.error = Some(anyhow::Error::new(err).context("append to spool"));
                    return report;
                }
            }
        }
        report
    }

    /// Drain up to `limit` oldest spool records into the store.
    ///
    /// A record that ingests (fresh or deduped) is acknowledged and leaves
    /// the spool. A record that fails to decode or ingest is marked failed
    /// and stays for the next cycle; one bad record never stops the batch.
    /// Cancellation returns the partial result.
    pub fn flush(&self, cancel: &CancellationToken, limit: usize) -> Result<FlushResult> {
        let mut result = FlushResult::default();
        let batch = self.spool.read_oldest(limit).context("read spool")?;
        if batch.skipped > 0 {
            warn!(
                skipped = batch.skipped,
                "spool contains undecodable files; leaving them for inspection"
            );
        }

        for entry in batch.entries {
            if cancel.is_cancelled() {
                break;
            }
            result.processed += 1;

            let request: IngestRequest = match serde_json::from_str(&entry.record.payload) {
                Ok(request) => request,
                Err(err) => {
                    result.failed += 1;
                    if let Err(mark_err) = self
                        .spool
                        .mark_failed(&entry.path, &format!("decode request: {}", err))
                    {
                        warn!(path = %entry.path.display(), error = %mark_err, "mark_failed after decode error");
                    }
                    continue;
                }
            };

            match self.store.ingest(&request) {
                Ok(outcome) => {
                    if outcome.deduped {
                        result.deduped += 1;
                    } else {
                        result.ingested += 1;
                    }
                    if let Err(ack_err) = self.spool.ack(&entry.path) {
                        // The record will replay and dedup next cycle.
                        warn!(path = %entry.path.display(), error = %ack_err, "ack failed");
                    }
                }
                Err(err) => {
                    result.failed += 1;
                    if let Err(mark_err) = self.spool.mark_failed(&entry.path, &err.to_string()) {
                        warn!(path = %entry.path.display(), error = %mark_err, "mark_failed after ingest error");
                    }
                }
            }
        }

        debug!(
            processed = result.processed,
            ingested = result.ingested,
            deduped = result.deduped,
            failed = result.failed,
            "flushed spool batch"
        );
        Ok(result)
    }
}
