//! Durable SQLite sink.
//!
//! Append-only audit store for every dispatched frame, plus bus session
//! records. Writes are buffered and committed in batches, bounded by
//! count or by elapsed time, whichever comes first, so frame-rate inserts
//! amortize to one transaction per batch while durability latency stays
//! bounded.
//!
//! Backups are consistent online snapshots into timestamped files next to
//! the database. With a file-backed store in WAL mode the snapshot runs on
//! its own read connection, so concurrent `accept` calls keep committing
//! to the live store for the whole copy; they only wait for the buffered
//! batch flushed at the start of the backup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::error::SinkError;
use crate::sink::FrameSink;
use crate::types::{BusSession, CanId, Direction, Frame};

/// Durable sink tuning.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Commit after this many buffered frames.
    pub batch_size: usize,
    /// Commit after this long even if the batch is not full.
    pub flush_interval: Duration,
    /// Where timestamped backups land. Defaults to `backups/` next to the
    /// database file.
    pub backup_dir: Option<PathBuf>,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            batch_size: 256,
            flush_interval: Duration::from_millis(500),
            backup_dir: None,
        }
    }
}

struct Inner {
    conn: Connection,
    pending: Vec<Arc<Frame>>,
    last_flush: Instant,
}

/// SQLite-backed durable store.
///
/// Thread-safe via an internal mutex (a rusqlite `Connection` is not
/// `Sync`). The lock is held for buffer pushes and batch commits only.
pub struct SqliteSink {
    inner: Mutex<Inner>,
    opts: SqliteOptions,
    /// `None` for in-memory stores (tests).
    path: Option<PathBuf>,
}

impl SqliteSink {
    /// Open (or create) a file-backed store.
    pub fn open<P: AsRef<Path>>(path: P, opts: SqliteOptions) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|_| SinkError::Storage {
                source: rusqlite::Error::InvalidPath(parent.to_path_buf()),
            })?;
        }

        let conn = Connection::open(path).map_err(SinkError::from_sqlite)?;
        // WAL keeps the backup's read connection from blocking writers
        conn.pragma_update(None, "journal_mode", "WAL").map_err(SinkError::from_sqlite)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(SinkError::from_sqlite)?;

        let sink = Self {
            inner: Mutex::new(Inner { conn, pending: Vec::new(), last_flush: Instant::now() }),
            opts,
            path: Some(path.to_path_buf()),
        };
        sink.init_schema()?;
        info!(path = %path.display(), "durable store opened");
        Ok(sink)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(opts: SqliteOptions) -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory().map_err(SinkError::from_sqlite)?;
        let sink = Self {
            inner: Mutex::new(Inner { conn, pending: Vec::new(), last_flush: Instant::now() }),
            opts,
            path: None,
        };
        sink.init_schema()?;
        Ok(sink)
    }

    fn init_schema(&self) -> Result<(), SinkError> {
        let inner = self.lock();
        inner
            .conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS frames (
                    channel       INTEGER NOT NULL,
                    sequence      INTEGER NOT NULL,
                    wall_clock_ns INTEGER NOT NULL,
                    monotonic_ns  INTEGER NOT NULL,
                    arb_id        INTEGER NOT NULL,
                    extended      INTEGER NOT NULL,
                    direction     TEXT    NOT NULL,
                    flags         INTEGER NOT NULL,
                    dropped       INTEGER NOT NULL,
                    payload       BLOB    NOT NULL,
                    PRIMARY KEY (channel, sequence)
                );
                CREATE INDEX IF NOT EXISTS idx_frames_wall_clock
                    ON frames(wall_clock_ns);
                CREATE TABLE IF NOT EXISTS sessions (
                    id            INTEGER NOT NULL,
                    channel       TEXT    NOT NULL,
                    bitrate       INTEGER NOT NULL,
                    started_at    TEXT    NOT NULL,
                    ended_at      TEXT,
                    restart_count INTEGER NOT NULL,
                    PRIMARY KEY (id, channel, started_at)
                );",
            )
            .map_err(SinkError::from_sqlite)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("sqlite sink lock")
    }

    fn flush_locked(inner: &mut Inner) -> Result<(), SinkError> {
        if inner.pending.is_empty() {
            inner.last_flush = Instant::now();
            return Ok(());
        }

        let tx = inner.conn.transaction().map_err(SinkError::from_sqlite)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO frames (channel, sequence, wall_clock_ns, monotonic_ns,
                        arb_id, extended, direction, flags, dropped, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .map_err(SinkError::from_sqlite)?;

            for frame in &inner.pending {
                stmt.execute(params![
                    frame.channel.0,
                    frame.sequence as i64,
                    frame.wall_clock.timestamp_nanos_opt().unwrap_or_default(),
                    frame.monotonic_ns as i64,
                    frame.id.raw(),
                    frame.id.is_extended(),
                    match frame.direction {
                        Direction::Rx => "rx",
                        Direction::Tx => "tx",
                    },
                    frame.flags.bits(),
                    frame.dropped,
                    frame.payload,
                ])
                .map_err(SinkError::from_sqlite)?;
            }
        }
        tx.commit().map_err(SinkError::from_sqlite)?;

        debug!(frames = inner.pending.len(), "batch committed");
        inner.pending.clear();
        inner.last_flush = Instant::now();
        Ok(())
    }

    /// Record (or update) a session audit row.
    pub fn record_session(&self, session: &BusSession) -> Result<(), SinkError> {
        let inner = self.lock();
        inner
            .conn
            .execute(
                "INSERT OR REPLACE INTO sessions
                    (id, channel, bitrate, started_at, ended_at, restart_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.id as i64,
                    session.channel,
                    session.bitrate,
                    session.started_at.to_rfc3339(),
                    session.ended_at.map(|t| t.to_rfc3339()),
                    session.restart_count,
                ],
            )
            .map_err(SinkError::from_sqlite)?;
        Ok(())
    }

    /// Take a consistent snapshot into a timestamped file.
    ///
    /// Buffered frames are committed first, so the snapshot reflects every
    /// frame accepted before this call. Returns the backup file path.
    pub fn backup(&self) -> Result<PathBuf, SinkError> {
        let dir = self.backup_dir()?;
        std::fs::create_dir_all(&dir).map_err(|e| SinkError::BackupFailed {
            path: dir.clone(),
            source: Box::new(e),
        })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let dest_path = dir.join(format!("canflow_{stamp}.db"));

        // Commit the buffer so the snapshot covers it
        Self::flush_locked(&mut self.lock())?;

        let mut dest = Connection::open(&dest_path).map_err(SinkError::from_sqlite)?;

        match &self.path {
            Some(path) => {
                // Separate read connection: the live one keeps committing
                let source = Connection::open(path).map_err(SinkError::from_sqlite)?;
                run_backup(&source, &mut dest, &dest_path)?;
            }
            None => {
                // In-memory store has a single connection; hold the lock
                let inner = self.lock();
                run_backup(&inner.conn, &mut dest, &dest_path)?;
            }
        }

        info!(path = %dest_path.display(), "backup completed");
        Ok(dest_path)
    }

    fn backup_dir(&self) -> Result<PathBuf, SinkError> {
        if let Some(dir) = &self.opts.backup_dir {
            return Ok(dir.clone());
        }
        match &self.path {
            Some(path) => {
                Ok(path.parent().unwrap_or_else(|| Path::new(".")).join("backups"))
            }
            None => Err(SinkError::BackupFailed {
                path: PathBuf::from("<in-memory>"),
                source: "in-memory store needs an explicit backup_dir".into(),
            }),
        }
    }

    /// Committed frame rows, gap markers included.
    pub fn frame_count(&self) -> Result<u64, SinkError> {
        self.count("SELECT COUNT(*) FROM frames")
    }

    /// Committed gap-marker rows.
    pub fn gap_marker_count(&self) -> Result<u64, SinkError> {
        self.count(&format!(
            "SELECT COUNT(*) FROM frames WHERE flags & {} != 0",
            crate::types::FrameFlags::GAP
        ))
    }

    /// Total adapter-side frame loss recorded by gap markers.
    pub fn dropped_total(&self) -> Result<u64, SinkError> {
        self.count("SELECT COALESCE(SUM(dropped), 0) FROM frames")
    }

    /// Session audit rows.
    pub fn session_count(&self) -> Result<u64, SinkError> {
        self.count("SELECT COUNT(*) FROM sessions")
    }

    fn count(&self, sql: &str) -> Result<u64, SinkError> {
        let inner = self.lock();
        let n: i64 =
            inner.conn.query_row(sql, [], |row| row.get(0)).map_err(SinkError::from_sqlite)?;
        Ok(n as u64)
    }

    /// Load the recorded sequences for one channel, in commit order.
    pub fn sequences(&self, channel: u8) -> Result<Vec<u64>, SinkError> {
        let inner = self.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT sequence FROM frames WHERE channel = ?1 ORDER BY sequence ASC")
            .map_err(SinkError::from_sqlite)?;
        let rows = stmt
            .query_map([channel], |row| row.get::<_, i64>(0))
            .map_err(SinkError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(SinkError::from_sqlite)?;
        Ok(rows.into_iter().map(|s| s as u64).collect())
    }
}

fn run_backup(
    source: &Connection,
    dest: &mut Connection,
    dest_path: &Path,
) -> Result<(), SinkError> {
    let backup = rusqlite::backup::Backup::new(source, dest).map_err(|e| {
        SinkError::BackupFailed { path: dest_path.to_path_buf(), source: Box::new(e) }
    })?;
    backup
        .run_to_completion(64, Duration::from_millis(5), None)
        .map_err(|e| SinkError::BackupFailed {
            path: dest_path.to_path_buf(),
            source: Box::new(e),
        })
}

#[async_trait]
impl FrameSink for SqliteSink {
    async fn accept(&self, frame: &Arc<Frame>) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.pending.push(Arc::clone(frame));

        let due = inner.pending.len() >= self.opts.batch_size
            || inner.last_flush.elapsed() >= self.opts.flush_interval;
        if due {
            if let Err(err) = Self::flush_locked(&mut inner) {
                // Hand the frame back to the dispatcher for redelivery;
                // earlier buffered frames stay queued for the next flush
                inner.pending.pop();
                return Err(err);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Self::flush_locked(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, FrameFlags};

    fn frame(channel: u8, sequence: u64) -> Arc<Frame> {
        Arc::new(Frame {
            channel: ChannelId(channel),
            id: CanId::Standard(0x351),
            payload: vec![1, 2, 3, 4],
            direction: Direction::Rx,
            flags: FrameFlags::default(),
            wall_clock: Utc::now(),
            monotonic_ns: sequence * 1_000,
            sequence,
            dropped: 0,
        })
    }

    fn gap(channel: u8, sequence: u64, dropped: u32) -> Arc<Frame> {
        Arc::new(Frame {
            channel: ChannelId(channel),
            id: CanId::Standard(0),
            payload: vec![],
            direction: Direction::Rx,
            flags: FrameFlags::default().with(FrameFlags::GAP),
            wall_clock: Utc::now(),
            monotonic_ns: sequence * 1_000,
            sequence,
            dropped,
        })
    }

    #[tokio::test]
    async fn commits_when_batch_fills() {
        let sink = SqliteSink::open_in_memory(SqliteOptions {
            batch_size: 4,
            flush_interval: Duration::from_secs(60),
            backup_dir: None,
        })
        .unwrap();

        for seq in 1..=3 {
            sink.accept(&frame(0, seq)).await.unwrap();
        }
        // Batch not full, interval not elapsed: nothing committed yet
        assert_eq!(sink.frame_count().unwrap(), 0);

        sink.accept(&frame(0, 4)).await.unwrap();
        assert_eq!(sink.frame_count().unwrap(), 4);
        assert_eq!(sink.sequences(0).unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn commits_when_interval_elapses() {
        let sink = SqliteSink::open_in_memory(SqliteOptions {
            batch_size: 1_000,
            flush_interval: Duration::from_millis(10),
            backup_dir: None,
        })
        .unwrap();

        sink.accept(&frame(0, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.accept(&frame(0, 2)).await.unwrap();

        assert_eq!(sink.frame_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn gap_markers_and_drop_totals_are_queryable() {
        let sink = SqliteSink::open_in_memory(SqliteOptions {
            batch_size: 1,
            flush_interval: Duration::from_secs(60),
            backup_dir: None,
        })
        .unwrap();

        sink.accept(&frame(0, 1)).await.unwrap();
        sink.accept(&gap(0, 2, 17)).await.unwrap();
        sink.accept(&frame(0, 3)).await.unwrap();

        assert_eq!(sink.frame_count().unwrap(), 3);
        assert_eq!(sink.gap_marker_count().unwrap(), 1);
        assert_eq!(sink.dropped_total().unwrap(), 17);
    }

    #[tokio::test]
    async fn records_sessions() {
        let sink = SqliteSink::open_in_memory(SqliteOptions::default()).unwrap();

        let mut session = BusSession::open(1, "can0", 500_000, 0);
        sink.record_session(&session).unwrap();
        assert_eq!(sink.session_count().unwrap(), 1);

        session.close();
        sink.record_session(&session).unwrap();
        // Close updates the existing row, it does not add one
        assert_eq!(sink.session_count().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backup_is_consistent_with_concurrent_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("live.db");
        let sink = Arc::new(
            SqliteSink::open(
                &db_path,
                SqliteOptions {
                    batch_size: 8,
                    flush_interval: Duration::from_millis(5),
                    backup_dir: Some(dir.path().join("backups")),
                },
            )
            .unwrap(),
        );

        for seq in 1..=100 {
            sink.accept(&frame(0, seq)).await.unwrap();
        }
        FrameSink::flush(sink.as_ref()).await.unwrap();
        let committed_before_backup = sink.frame_count().unwrap();

        // Keep accepting while the backup runs
        let writer = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                for seq in 101..=200 {
                    sink.accept(&frame(0, seq)).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let backup_path = sink.backup().unwrap();
        writer.await.unwrap();

        // The snapshot holds at least everything committed before it
        // started, with no duplicates and no holes
        let copy = Connection::open(&backup_path).unwrap();
        let rows: Vec<i64> = copy
            .prepare("SELECT sequence FROM frames ORDER BY sequence ASC")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(rows.len() as u64 >= committed_before_backup);
        for (i, seq) in rows.iter().enumerate() {
            assert_eq!(*seq, i as i64 + 1, "backup has a hole or duplicate");
        }
    }

    #[tokio::test]
    async fn in_memory_backup_requires_explicit_dir() {
        let sink = SqliteSink::open_in_memory(SqliteOptions::default()).unwrap();
        assert!(matches!(sink.backup(), Err(SinkError::BackupFailed { .. })));
    }
}
