mod dedup;
mod error;
mod event;
mod normalize;
mod snapshot;
mod telemetry;
mod util;

pub use dedup::build_dedup_key;
pub use error::{Error, Result};
pub use event::{EventStatus, EventType, IngestRequest, Payload, SourceChannel};
pub use normalize::{DEFAULT_NORMALIZATION_VERSION, DEFAULT_SOURCE_SCHEMA_VERSION, normalize};
pub use snapshot::{
    DailyPoint, LimitSnapshotEnvelope, Metric, POLLER_SOURCE_SYSTEM, SNAPSHOT_SCHEMA_VERSION,
    UsageSnapshot,
};
pub use telemetry::{TelemetryChannel, TelemetryEvent, TelemetryEventType, TelemetryStatus};
pub use util::{format_store_time, is_blank, parse_store_time, sanitize_metric_id};
