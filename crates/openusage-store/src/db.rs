use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::Connection;

use crate::schema;
use crate::{Error, Result};

const READER_POOL_SIZE: usize = 2;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the telemetry database.
///
/// One writer connection behind a mutex serializes ingest and maintenance;
/// a small pool of reader connections serves read-model queries so a long
/// aggregation does not block ingest. WAL keeps readers and the writer out
/// of each other's way; the UNIQUE index on dedup_key serializes
/// conflicting inserts at the database layer.
pub struct Store {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = open_connection(db_path)?;
        schema::init_schema(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            readers.push(Mutex::new(open_connection(db_path)?));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// In-memory store for tests. Reads fall back to the writer connection
    /// because separate connections would each see their own database.
    pub fn open_in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        apply_pragmas(&writer)?;
        schema::init_schema(&writer)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().unwrap();
        f(&mut conn)
    }

    pub(crate) fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.readers.is_empty() {
            let conn = self.writer.lock().unwrap();
            return f(&conn);
        }
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[index].lock().unwrap();
        f(&conn)
    }

    /// Total canonical events (test and diagnostics helper).
    pub fn canonical_event_count(&self) -> Result<i64> {
        self.with_reader(|conn| {
            conn.query_row("SELECT COUNT(*) FROM usage_events", [], |row| row.get(0))
                .map_err(Error::from)
        })
    }

    /// Total raw audit rows (test and diagnostics helper).
    pub fn raw_event_count(&self) -> Result<i64> {
        self.with_reader(|conn| {
            conn.query_row("SELECT COUNT(*) FROM usage_raw_events", [], |row| row.get(0))
                .map_err(Error::from)
        })
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    // journal_mode returns the resulting mode as a row
    conn.query_row("PRAGMA journal_mode = WAL", [], |row| {
        row.get::<_, String>(0)
    })?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}
