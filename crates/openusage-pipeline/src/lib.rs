mod collector;
mod config;
mod pipeline;
mod quota;
mod runtime;

pub use collector::{Collector, SourceCollector, TelemetrySource, map_telemetry_event};
pub use config::{PipelineConfig, SpoolCleanupConfig};
pub use pipeline::{EnqueueReport, FlushResult, Pipeline};
pub use quota::{
    POLLER_SOURCE_SYSTEM, SNAPSHOT_SCHEMA_VERSION, ingest_usage_snapshots, snapshot_requests,
};
pub use runtime::{
    AutoCollector, CollectorError, CycleCallback, CycleError, CycleResult, DEFAULT_COLLECT_INTERVAL,
    DEFAULT_FLUSH_BATCH, DEFAULT_MAX_FLUSH,
};
