// Embedded relational store for the telemetry stream: an immutable raw
// audit log plus a canonical event table with a unique dedup key and a
// transactional enrich-on-conflict protocol.

mod db;
mod error;
mod ingest;
mod maintenance;
mod queries;
mod records;
mod schema;

pub use db::Store;
pub use error::{Error, Result};
pub use maintenance::CompactionStats;
pub use queries::{
    DailyDimensionRow, DailyTotalRow, DimensionUsageRow, LimitSnapshotRow, ModelUsageRow,
    ProviderUsageRow, ToolUsageRow, UsageScope, UsageSummary,
};
pub use records::{CanonicalEventRow, IngestOutcome, RawEventRow};
pub use schema::SCHEMA_VERSION;
