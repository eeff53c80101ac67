use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::record::SpoolRecord;

const SPOOL_EXT: &str = "jsonl";
const MAX_LAST_ERROR_CHARS: usize = 256;

/// A decoded spool record together with the file it came from.
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    pub path: PathBuf,
    pub record: SpoolRecord,
}

/// Result of `read_oldest`: decoded records in creation order plus the
/// number of files that failed to decode and were left on disk.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub entries: Vec<SpoolEntry>,
    pub skipped: usize,
}

/// Retention limits enforced by `cleanup`, oldest files removed first.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupPolicy {
    pub max_age: Option<Duration>,
    pub max_files: Option<usize>,
    pub max_total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolStats {
    pub files: usize,
    pub total_bytes: u64,
}

/// Append-only directory of one-record files.
///
/// Filenames are `<zero-padded-nanos>_<sanitized-spool-id>.jsonl`, so plain
/// lexicographic filename order is total creation-time order. Appends write
/// a temp file next to the target and rename into place; concurrent
/// appenders are safe because temp names are unique.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one record, assigning spool id and creation time when unset.
    /// Returns the final path.
    pub fn append(&self, record: &SpoolRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let mut record = record.clone();
        if record.spool_id.trim().is_empty() {
            record.spool_id = Uuid::new_v4().to_string();
        }
        if record.created_at.is_none() {
            record.created_at = Some(Utc::now());
        }

        let path = self.dir.join(file_name(&record));
        self.write_atomic(&path, &record)?;
        Ok(path)
    }

    /// Decode up to `limit` oldest records. Files that fail to decode are
    /// skipped (and stay on disk for inspection); the skip count is
    /// reported on the batch.
    pub fn read_oldest(&self, limit: usize) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        if limit == 0 {
            return Ok(batch);
        }

        for path in self.sorted_files()? {
            if batch.entries.len() >= limit {
                break;
            }
            match read_record(&path) {
                Ok(record) => batch.entries.push(SpoolEntry { path, record }),
                Err(err) => {
                    batch.skipped += 1;
                    warn!(path = %path.display(), error = %err, "skipping undecodable spool file");
                }
            }
        }

        Ok(batch)
    }

    /// Remove a spooled file. A missing file is a no-op: the record was
    /// already acknowledged by a previous pass.
    pub fn ack(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Record a failed ingest attempt: bump the attempt counter and store a
    /// truncated error, rewriting the file atomically in place.
    pub fn mark_failed(&self, path: &Path, error: &str) -> Result<()> {
        let mut record = read_record(path)?;
        record.attempt += 1;
        record.last_error = Some(truncate_error(error));
        self.write_atomic(path, &record)
    }

    /// Enforce any combination of max age, max file count and max total
    /// bytes. Removal order is oldest first. Returns the number of files
    /// removed.
    pub fn cleanup(&self, policy: &CleanupPolicy) -> Result<usize> {
        let mut removed = 0;
        let mut files = self.sized_files()?;

        if let Some(max_age) = policy.max_age {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
            files.retain(|(path, _)| {
                let expired = created_at_from_name(path).is_some_and(|created| created < cutoff);
                if expired && fs::remove_file(path).is_ok() {
                    removed += 1;
                    return false;
                }
                true
            });
        }

        if let Some(max_files) = policy.max_files {
            while files.len() > max_files {
                let (path, _) = files.remove(0);
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if let Some(max_bytes) = policy.max_total_bytes {
            let mut total: u64 = files.iter().map(|(_, size)| size).sum();
            while total > max_bytes && !files.is_empty() {
                let (path, size) = files.remove(0);
                fs::remove_file(&path)?;
                total = total.saturating_sub(size);
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// File count and total bytes currently spooled.
    pub fn stats(&self) -> Result<SpoolStats> {
        let files = self.sized_files()?;
        Ok(SpoolStats {
            files: files.len(),
            total_bytes: files.iter().map(|(_, size)| size).sum(),
        })
    }

    fn write_atomic(&self, path: &Path, record: &SpoolRecord) -> Result<()> {
        let tmp = self
            .dir
            .join(format!(".tmp-{}", Uuid::new_v4().simple()));
        let encoded = serde_json::to_vec(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Spool files in filename (= creation) order. Unrecognized filenames
    /// are ignored.
    fn sorted_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if is_spool_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn sized_files(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut out = Vec::new();
        for path in self.sorted_files()? {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            out.push((path, size));
        }
        Ok(out)
    }
}

fn is_spool_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some(SPOOL_EXT) {
        return false;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| {
            let mut parts = stem.splitn(2, '_');
            let nanos = parts.next().unwrap_or_default();
            parts.next().is_some() && !nanos.is_empty() && nanos.bytes().all(|b| b.is_ascii_digit())
        })
}

fn file_name(record: &SpoolRecord) -> String {
    let nanos = record
        .created_at
        .and_then(|ts| ts.timestamp_nanos_opt())
        .unwrap_or(0)
        .max(0);
    format!("{:020}_{}.{}", nanos, sanitize_id(&record.spool_id), SPOOL_EXT)
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn created_at_from_name(path: &Path) -> Option<DateTime<Utc>> {
    let stem = path.file_stem()?.to_str()?;
    let nanos: i64 = stem.split('_').next()?.parse().ok()?;
    Some(DateTime::<Utc>::from_timestamp_nanos(nanos))
}

fn read_record(path: &Path) -> Result<SpoolRecord> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_LAST_ERROR_CHARS {
        return error.to_string();
    }
    let mut out: String = error.chars().take(MAX_LAST_ERROR_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use openusage_types::SourceChannel;
    use tempfile::TempDir;

    fn record(payload: &str) -> SpoolRecord {
        SpoolRecord::new("claude_code", SourceChannel::Hook, payload)
    }

    fn spool_with_records(count: usize) -> (TempDir, Spool) {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        for i in 0..count {
            let mut r = record(&format!("payload-{}", i));
            // Deterministic ordering without sleeping between appends. The
            // sub-second part stays non-zero so every record serializes to
            // the same byte length (cleanup-by-bytes counts on it).
            r.created_at = Some(
                DateTime::<Utc>::from_timestamp_nanos(1_700_000_000_000_000_001 + i as i64),
            );
            spool.append(&r).unwrap();
        }
        (dir, spool)
    }

    #[test]
    fn test_append_assigns_id_and_time() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());

        let path = spool.append(&record("p")).unwrap();
        assert!(path.exists());

        let batch = spool.read_oldest(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
        let stored = &batch.entries[0].record;
        assert!(!stored.spool_id.is_empty());
        assert!(stored.created_at.is_some());
        assert_eq!(stored.payload, "p");
        assert_eq!(stored.attempt, 0);
    }

    #[test]
    fn test_read_oldest_is_fifo() {
        let (_dir, spool) = spool_with_records(5);

        let batch = spool.read_oldest(5).unwrap();
        assert_eq!(batch.skipped, 0);
        let payloads: Vec<_> = batch
            .entries
            .iter()
            .map(|e| e.record.payload.clone())
            .collect();
        assert_eq!(
            payloads,
            vec!["payload-0", "payload-1", "payload-2", "payload-3", "payload-4"]
        );
    }

    #[test]
    fn test_read_oldest_respects_limit() {
        let (_dir, spool) = spool_with_records(5);
        let batch = spool.read_oldest(2).unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[0].record.payload, "payload-0");
    }

    #[test]
    fn test_malformed_file_skipped_and_kept() {
        let (dir, spool) = spool_with_records(2);
        let bad = dir
            .path()
            .join(format!("{:020}_deadbeef.{}", 1_600_000_000_000_000_000u64, SPOOL_EXT));
        fs::write(&bad, b"not json").unwrap();

        let batch = spool.read_oldest(10).unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.skipped, 1);
        assert!(bad.exists());
    }

    #[test]
    fn test_unrecognized_filenames_ignored() {
        let (dir, spool) = spool_with_records(1);
        fs::write(dir.path().join("README.txt"), b"hello").unwrap();
        fs::write(dir.path().join("noprefix.jsonl"), b"{}").unwrap();

        let batch = spool.read_oldest(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn test_ack_removes_and_tolerates_missing() {
        let (_dir, spool) = spool_with_records(1);
        let batch = spool.read_oldest(1).unwrap();
        let path = batch.entries[0].path.clone();

        spool.ack(&path).unwrap();
        assert!(!path.exists());
        spool.ack(&path).unwrap();
    }

    #[test]
    fn test_mark_failed_increments_attempt() {
        let (_dir, spool) = spool_with_records(1);
        let path = spool.read_oldest(1).unwrap().entries[0].path.clone();

        spool.mark_failed(&path, "boom").unwrap();
        spool.mark_failed(&path, "boom again").unwrap();

        let record = &spool.read_oldest(1).unwrap().entries[0].record;
        assert_eq!(record.attempt, 2);
        assert_eq!(record.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_mark_failed_truncates_long_errors() {
        let (_dir, spool) = spool_with_records(1);
        let path = spool.read_oldest(1).unwrap().entries[0].path.clone();

        let long = "x".repeat(1000);
        spool.mark_failed(&path, &long).unwrap();

        let stored = spool.read_oldest(1).unwrap().entries[0]
            .record
            .last_error
            .clone()
            .unwrap();
        assert_eq!(stored.chars().count(), MAX_LAST_ERROR_CHARS + 1);
        assert!(stored.ends_with('…'));
    }

    #[test]
    fn test_cleanup_max_files_keeps_newest() {
        let (_dir, spool) = spool_with_records(5);

        let removed = spool
            .cleanup(&CleanupPolicy {
                max_files: Some(2),
                ..CleanupPolicy::default()
            })
            .unwrap();
        assert_eq!(removed, 3);

        let batch = spool.read_oldest(10).unwrap();
        let payloads: Vec<_> = batch
            .entries
            .iter()
            .map(|e| e.record.payload.clone())
            .collect();
        assert_eq!(payloads, vec!["payload-3", "payload-4"]);
    }

    #[test]
    fn test_cleanup_max_age_removes_old() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());

        let mut old = record("old");
        old.created_at = Some(Utc::now() - chrono::Duration::hours(3));
        spool.append(&old).unwrap();
        spool.append(&record("fresh")).unwrap();

        let removed = spool
            .cleanup(&CleanupPolicy {
                max_age: Some(Duration::from_secs(3600)),
                ..CleanupPolicy::default()
            })
            .unwrap();
        assert_eq!(removed, 1);

        let batch = spool.read_oldest(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].record.payload, "fresh");
    }

    #[test]
    fn test_cleanup_max_bytes_removes_oldest_first() {
        let (_dir, spool) = spool_with_records(4);
        let per_file = spool.stats().unwrap().total_bytes / 4;

        let removed = spool
            .cleanup(&CleanupPolicy {
                max_total_bytes: Some(per_file * 2),
                ..CleanupPolicy::default()
            })
            .unwrap();
        assert_eq!(removed, 2);

        let batch = spool.read_oldest(10).unwrap();
        assert_eq!(batch.entries[0].record.payload, "payload-2");
    }

    #[test]
    fn test_stats() {
        let (_dir, spool) = spool_with_records(3);
        let stats = spool.stats().unwrap();
        assert_eq!(stats.files, 3);
        assert!(stats.total_bytes > 0);
    }
}
