// Durable spool: a directory of one-record files between collectors and
// the ingest store. Appends land before ingest runs, so a crash between
// enqueue and ingest replays the record on restart (at-least-once).

mod error;
mod record;
mod spool;

pub use error::{Error, Result};
pub use record::SpoolRecord;
pub use spool::{CleanupPolicy, ReadBatch, Spool, SpoolEntry, SpoolStats};
