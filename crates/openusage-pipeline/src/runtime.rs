use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collector::Collector;
use crate::pipeline::{FlushResult, Pipeline};

pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FLUSH: usize = 50_000;
pub const DEFAULT_FLUSH_BATCH: usize = 10_000;

/// One collector's failure during a cycle. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorError {
    pub collector: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct CycleResult {
    pub collected: usize,
    pub enqueued: usize,
    pub flush: FlushResult,
    pub collector_errors: Vec<CollectorError>,
}

/// Fatal cycle failure carrying whatever the cycle managed before dying.
/// Only a broken spool (enqueue) or broken spool read (flush) gets here.
#[derive(Debug)]
pub struct CycleError {
    pub partial: CycleResult,
    pub source: anyhow::Error,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection cycle failed: {}", self.source)
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub type CycleCallback = dyn Fn(&CycleResult, Option<&anyhow::Error>) + Send + Sync;

/// Drives collect → enqueue → flush on a timer.
///
/// Collectors run sequentially within a cycle; the spool append is the
/// narrow waist and collection order is unimportant. Collector failures
/// are recorded and skipped. The spool drain runs in bounded batches until
/// the cycle cap is reached, a batch comes back empty, or a batch makes no
/// forward progress.
pub struct AutoCollector {
    collectors: Vec<Box<dyn Collector>>,
    pipeline: Pipeline,
    max_flush: usize,
    flush_batch: usize,
}

impl AutoCollector {
    pub fn new(collectors: Vec<Box<dyn Collector>>, pipeline: Pipeline) -> Self {
        Self {
            collectors,
            pipeline,
            max_flush: DEFAULT_MAX_FLUSH,
            flush_batch: DEFAULT_FLUSH_BATCH,
        }
    }

    pub fn with_max_flush(mut self, max_flush: usize) -> Self {
        self.max_flush = max_flush;
        self
    }

    pub fn with_flush_batch(mut self, flush_batch: usize) -> Self {
        self.flush_batch = flush_batch.max(1);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// One collect → enqueue → flush pass.
    pub fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleResult, CycleError> {
        let mut result = CycleResult::default();
        let mut pending = Vec::new();

        for collector in &self.collectors {
            if cancel.is_cancelled() {
                break;
            }
            match collector.collect(cancel) {
                Ok(requests) => {
                    result.collected += requests.len();
                    pending.extend(requests);
                }
                Err(err) => {
                    warn!(collector = collector.name(), error = %err, "collector failed; skipping");
                    result.collector_errors.push(CollectorError {
                        collector: collector.name().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let report = self.pipeline.enqueue_requests(&pending);
        result.enqueued = report.enqueued;
        if let Some(err) = report.error {
            return Err(CycleError {
                partial: result,
                source: err,
            });
        }

        while result.flush.processed < self.max_flush {
            if cancel.is_cancelled() {
                break;
            }
            let batch_limit = self
                .flush_batch
                .min(self.max_flush - result.flush.processed);
            let batch = match self.pipeline.flush(cancel, batch_limit) {
                Ok(batch) => batch,
                Err(err) => {
                    return Err(CycleError {
                        partial: result,
                        source: err,
                    });
                }
            };
            let stop = batch.processed == 0 || !batch.forward_progress();
            result.flush.absorb(batch);
            if stop {
                break;
            }
        }

        debug!(
            collected = result.collected,
            enqueued = result.enqueued,
            processed = result.flush.processed,
            "collection cycle finished"
        );
        Ok(result)
    }

    /// Run an immediate cycle, then one per `interval` until the token is
    /// cancelled. Each cycle invokes the optional callback with its result
    /// and error.
    pub async fn run(
        &self,
        interval: Duration,
        cancel: CancellationToken,
        on_cycle: Option<Box<CycleCallback>>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_cycle(&cancel) {
                        Ok(result) => {
                            if let Some(callback) = &on_cycle {
                                callback(&result, None);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "collection cycle failed");
                            if let Some(callback) = &on_cycle {
                                callback(&err.partial, Some(&err.source));
                            }
                        }
                    }
                }
            }
        }
    }
}
