//! # Sample Store Module
//!
//! Append-only persistence of heart-rate samples in SQLite, plus the range
//! queries used for trend views.
//!
//! ## Architecture
//! - **SampleStore**: cheap cloneable handle; `append` only queues a command
//! - **Writer Thread**: single background thread owning the write connection,
//!   so rows land in arrival order
//! - **Staging buffer**: samples accepted by the writer but not yet committed.
//!   When the database is unavailable they stay here and are retried
//! - **Readers**: every query opens its own connection (WAL mode), pins itself
//!   to the committed row-id high-water mark and merges the staging snapshot,
//!   so a sample is seen exactly once whether or not it was committed yet
//!
//! ## Table Layout
//! ```text
//! samples
//! ├── id              INTEGER PRIMARY KEY AUTOINCREMENT
//! ├── timestamp       INTEGER  (ms since Unix epoch, indexed)
//! ├── bpm             INTEGER
//! ├── source          TEXT     ('REAL' | 'MOCK')
//! └── device_address  TEXT     (NULL when no device was connected)
//! ```
//!
//! ## Caching
//! Aggregates over a range that ends at or before the newest staged sample
//! can no longer change (timestamps never go backwards), so those results are
//! kept in an LRU cache.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::sample::{AggregateBucket, Granularity, Sample, Source};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// A sample waiting to be written, with the device it came from
#[derive(Debug, Clone)]
struct StagedSample {
    sample: Sample,
    device_address: Option<String>,
}

/// Command sent from the live path to the writer thread
#[derive(Debug)]
enum StoreCommand {
    Append(StagedSample),
    /// Commit everything staged, then reply with what is still buffered
    Flush(Sender<usize>),
    /// Final commit, reply with what is still buffered, exit
    Stop(Sender<usize>),
}

type CacheKey = (Granularity, i64, i64);

/// State shared between the writer thread and readers
struct StoreState {
    /// Accepted but not committed, in arrival order
    staging: VecDeque<StagedSample>,
    /// Highest row id known to be committed
    committed_id: i64,
    /// Newest timestamp staged or committed
    latest_timestamp: Option<i64>,
    degraded: bool,
    /// Samples discarded because the staging buffer overflowed
    dropped: u64,
    cache: LruCache<CacheKey, Vec<AggregateBucket>>,
}

/// What a reader needs to see a consistent picture
struct ReadSnapshot {
    high_water: i64,
    /// Staged samples inside the queried range, timestamp-ascending
    staged: Vec<Sample>,
    /// Whether the range can still receive samples
    closed: bool,
}

struct StoreInner {
    command_tx: Sender<StoreCommand>,
    writer_thread: Mutex<Option<thread::JoinHandle<()>>>,
    state: Arc<Mutex<StoreState>>,
    config: StoreConfig,
}

/// Handle to the sample database. Clones share one writer thread.
#[derive(Clone)]
pub struct SampleStore {
    inner: Arc<StoreInner>,
}

impl SampleStore {
    /// Open (or create) the database and start the writer thread.
    ///
    /// Never fails: if the database cannot be opened the store starts in
    /// degraded mode and the writer keeps retrying.
    pub fn open(config: &StoreConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        let mut state = StoreState {
            staging: VecDeque::new(),
            committed_id: 0,
            latest_timestamp: None,
            degraded: false,
            dropped: 0,
            cache: LruCache::new(capacity),
        };

        let conn = match open_writer(&config.database) {
            Ok((conn, max_id, max_ts)) => {
                log::info!("Sample store opened: {}", config.database.display());
                state.committed_id = max_id;
                state.latest_timestamp = max_ts;
                Some(conn)
            }
            Err(e) => {
                log::warn!("{}", StoreError::PersistenceUnavailable(e.to_string()));
                state.degraded = true;
                None
            }
        };

        let state = Arc::new(Mutex::new(state));
        let (command_tx, command_rx) = unbounded();
        let writer = Writer {
            conn,
            state: state.clone(),
            config: config.clone(),
        };
        let writer_thread = thread::Builder::new()
            .name("sample-writer".to_string())
            .spawn(move || writer.run(command_rx));

        let writer_thread = match writer_thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to start sample writer thread: {}", e);
                None
            }
        };

        SampleStore {
            inner: Arc::new(StoreInner {
                command_tx,
                writer_thread: Mutex::new(writer_thread),
                state,
                config: config.clone(),
            }),
        }
    }

    /// Queue a sample for persistence.
    ///
    /// Non-blocking: the writer thread commits it in the background.
    pub fn append(&self, sample: Sample, device_address: Option<String>) {
        let staged = StagedSample { sample, device_address };
        if self.inner.command_tx.send(StoreCommand::Append(staged)).is_err() {
            log::error!("{}, sample at {} lost", StoreError::WriterUnavailable, sample.timestamp);
        }
    }

    /// Ask the writer to commit everything queued so far and wait for it.
    ///
    /// Returns `PersistenceUnavailable` if samples queued before the call are
    /// still buffered afterwards. Samples appended concurrently do not count.
    pub fn flush(&self, timeout: Duration) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.inner
            .command_tx
            .send(StoreCommand::Flush(reply_tx))
            .map_err(|_| StoreError::WriterUnavailable)?;
        let pending = reply_rx
            .recv_timeout(timeout)
            .map_err(|_| StoreError::PersistenceUnavailable("flush timed out".to_string()))?;

        match pending {
            0 => Ok(()),
            n => Err(StoreError::PersistenceUnavailable(format!("{} samples still buffered", n))),
        }
    }

    /// Stop the writer after a final best-effort commit bounded by `timeout`.
    ///
    /// A writer that misses the deadline is detached rather than joined.
    pub fn shutdown(&self, timeout: Duration) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.inner.command_tx.send(StoreCommand::Stop(reply_tx)).is_err() {
            return;
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(pending) => {
                if let Some(handle) = self.inner.writer_thread.lock().take() {
                    let _ = handle.join();
                }
                if pending > 0 {
                    log::error!("Shutting down with {} unpersisted samples", pending);
                }
            }
            Err(_) => {
                drop(self.inner.writer_thread.lock().take());
                log::warn!(
                    "Sample writer did not finish within {} ms, queued samples may be lost",
                    timeout.as_millis()
                );
            }
        }
    }

    /// Samples accepted by the writer but not yet committed
    pub fn pending(&self) -> usize {
        self.inner.state.lock().staging.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.state.lock().degraded
    }

    /// Samples discarded because the in-memory buffer overflowed
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().dropped
    }

    fn snapshot(&self, from: i64, to: i64) -> ReadSnapshot {
        let state = self.inner.state.lock();
        let mut staged: Vec<Sample> = state
            .staging
            .iter()
            .map(|s| s.sample)
            .filter(|s| s.timestamp >= from && s.timestamp < to)
            .collect();
        staged.sort_by_key(|s| s.timestamp);

        ReadSnapshot {
            high_water: state.committed_id,
            staged,
            closed: state.latest_timestamp.map_or(false, |latest| to <= latest),
        }
    }

    fn open_reader(&self) -> Option<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match Connection::open_with_flags(&self.inner.config.database, flags) {
            Ok(conn) => {
                if let Err(e) = conn.busy_timeout(BUSY_TIMEOUT) {
                    log::debug!("Could not set busy timeout on reader: {}", e);
                }
                Some(conn)
            }
            Err(e) => {
                log::warn!("History reads limited to buffered samples: {}", e);
                None
            }
        }
    }

    /// Samples in `[from, to)`, timestamp-ascending, fetched page by page.
    pub fn query_raw(&self, from: i64, to: i64) -> RawCursor {
        if from >= to {
            return RawCursor::empty();
        }
        let snapshot = self.snapshot(from, to);
        RawCursor {
            conn: self.open_reader(),
            to,
            high_water: snapshot.high_water,
            last_key: (from, i64::MIN),
            first_page: true,
            page_size: self.inner.config.page_size.max(1),
            page: VecDeque::new(),
            staged: snapshot.staged.into(),
            exhausted: false,
        }
    }

    /// The most recent `limit` samples in `[from, to)`, timestamp-ascending
    pub fn query_raw_tail(
        &self,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<Sample>, StoreError> {
        if from >= to || limit == 0 {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot(from, to);
        let mut samples = Vec::new();

        if let Some(conn) = self.open_reader() {
            let mut stmt = conn.prepare_cached(
                "SELECT id, timestamp, bpm, source FROM samples
                 WHERE timestamp >= ?1 AND timestamp < ?2 AND id <= ?3
                 ORDER BY timestamp DESC, id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![from, to, snapshot.high_water, limit as i64],
                read_row,
            )?;
            for row in rows {
                samples.push(row??.1);
            }
            samples.reverse();
        }

        samples.extend(snapshot.staged);
        samples.sort_by_key(|s| s.timestamp);
        let skip = samples.len().saturating_sub(limit);
        Ok(samples.split_off(skip))
    }

    /// Average BPM per calendar bucket over `[from, to)`; empty buckets are omitted
    pub fn query_aggregate(
        &self,
        from: i64,
        to: i64,
        granularity: Granularity,
    ) -> Result<Vec<AggregateBucket>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot(from, to);
        let key = (granularity, from, to);

        if snapshot.closed {
            if let Some(cached) = self.inner.state.lock().cache.get(&key) {
                return Ok(cached.clone());
            }
        }

        let mut buckets: BTreeMap<i64, AggregateBucket> = BTreeMap::new();
        if let Some(conn) = self.open_reader() {
            let period = granularity.period_ms();
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp - (((timestamp % ?4) + ?4) % ?4) AS bucket, COUNT(*), SUM(bpm)
                 FROM samples
                 WHERE timestamp >= ?1 AND timestamp < ?2 AND id <= ?3
                 GROUP BY bucket ORDER BY bucket",
            )?;
            let rows = stmt.query_map(params![from, to, snapshot.high_water, period], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (start, count, sum) = row?;
                buckets.insert(start, AggregateBucket::new(start, count as u64, sum as u64));
            }
        }

        for sample in &snapshot.staged {
            let start = granularity.bucket_start(sample.timestamp);
            buckets
                .entry(start)
                .or_insert_with(|| AggregateBucket::new(start, 0, 0))
                .merge(1, sample.bpm as u64);
        }

        let result: Vec<AggregateBucket> = buckets.into_values().collect();
        if snapshot.closed {
            self.inner.state.lock().cache.put(key, result.clone());
        }
        Ok(result)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Signal writer thread to stop after a final commit
        let (reply_tx, _reply_rx) = bounded(1);
        let _ = self.command_tx.send(StoreCommand::Stop(reply_tx));

        if let Some(handle) = self.writer_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Lazy, timestamp-ordered iterator over a raw history range.
///
/// Pages through the index with keyset pagination so memory stays bounded by
/// the page size, then merges in samples that were still staged when the
/// query started.
pub struct RawCursor {
    conn: Option<Connection>,
    to: i64,
    high_water: i64,
    /// (timestamp, id) of the last row read from the database
    last_key: (i64, i64),
    first_page: bool,
    page_size: usize,
    page: VecDeque<Sample>,
    staged: VecDeque<Sample>,
    exhausted: bool,
}

impl RawCursor {
    fn empty() -> Self {
        RawCursor {
            conn: None,
            to: 0,
            high_water: 0,
            last_key: (0, 0),
            first_page: true,
            page_size: 1,
            page: VecDeque::new(),
            staged: VecDeque::new(),
            exhausted: true,
        }
    }

    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => {
                self.exhausted = true;
                return Ok(());
            }
        };

        let (last_ts, last_id) = self.last_key;
        // first page includes rows at exactly `from`
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, bpm, source FROM samples
             WHERE timestamp < ?2 AND id <= ?3
               AND (timestamp > ?1 OR (timestamp = ?1 AND id > ?4))
             ORDER BY timestamp, id LIMIT ?5",
        )?;
        let floor_id = if self.first_page { i64::MIN } else { last_id };
        let rows = stmt.query_map(
            params![last_ts, self.to, self.high_water, floor_id, self.page_size as i64],
            read_row,
        )?;

        let mut fetched = 0;
        for row in rows {
            let (id, sample) = row??;
            self.last_key = (sample.timestamp, id);
            self.page.push_back(sample);
            fetched += 1;
        }
        self.first_page = false;
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for RawCursor {
    type Item = Result<Sample, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let take_staged = match (self.page.front(), self.staged.front()) {
            (Some(db), Some(staged)) => staged.timestamp < db.timestamp,
            (None, Some(_)) => true,
            _ => false,
        };
        if take_staged {
            self.staged.pop_front().map(Ok)
        } else {
            self.page.pop_front().map(Ok)
        }
    }
}

/// Map a `samples` row to `(id, Sample)`; unknown source tags become a query error
fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<(i64, Sample), StoreError>> {
    let id: i64 = row.get(0)?;
    let timestamp: i64 = row.get(1)?;
    let bpm: i64 = row.get(2)?;
    let source: String = row.get(3)?;

    let parsed = match (Source::parse(&source), u16::try_from(bpm)) {
        (Some(source), Ok(bpm)) => Ok((id, Sample::new(timestamp, bpm, source))),
        _ => Err(StoreError::QueryFailed(format!(
            "row {} has invalid bpm {} or source {:?}",
            id, bpm, source
        ))),
    };
    Ok(parsed)
}

/// Open the write connection, create the schema and read the high-water marks
fn open_writer(path: &Path) -> Result<(Connection, i64, Option<i64>), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::PersistenceUnavailable(e.to_string()))?;
        }
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;",
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            bpm INTEGER NOT NULL,
            source TEXT NOT NULL,
            device_address TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON samples(timestamp)",
        [],
    )?;

    let (max_id, max_ts) = conn.query_row(
        "SELECT COALESCE(MAX(id), 0), MAX(timestamp) FROM samples",
        [],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
    )?;

    Ok((conn, max_id, max_ts))
}

/// Owns the write connection; lives on the writer thread
struct Writer {
    conn: Option<Connection>,
    state: Arc<Mutex<StoreState>>,
    config: StoreConfig,
}

impl Writer {
    /// Writer thread loop
    ///
    /// Commits whenever the command queue runs dry, so bursts become one
    /// transaction. While degraded, appends are only staged and the database
    /// is retried once per retry interval (or on flush and stop).
    fn run(mut self, command_rx: Receiver<StoreCommand>) {
        let mut retry_at = self.retry_deadline();

        loop {
            if retry_at.map_or(false, |deadline| Instant::now() >= deadline) {
                self.commit();
                retry_at = self.retry_deadline();
            }

            let received = match retry_at {
                Some(deadline) => command_rx.recv_deadline(deadline),
                None => command_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(StoreCommand::Append(staged)) => {
                    self.stage(staged);
                    if retry_at.is_none() && command_rx.is_empty() {
                        self.commit();
                        retry_at = self.retry_deadline();
                    }
                }
                Ok(StoreCommand::Flush(reply)) => {
                    self.commit();
                    retry_at = self.retry_deadline();
                    let _ = reply.send(self.pending());
                }
                Ok(StoreCommand::Stop(reply)) => {
                    self.commit();
                    let _ = reply.send(self.pending());
                    log::info!("Sample writer stopped");
                    return;
                }
                // the retry runs at the top of the loop
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.commit();
        log::info!("Sample writer: command channel closed");
    }

    fn pending(&self) -> usize {
        self.state.lock().staging.len()
    }

    /// When to try the database again; `None` while it is healthy
    fn retry_deadline(&self) -> Option<Instant> {
        if self.state.lock().degraded {
            Some(Instant::now() + self.config.retry_interval())
        } else {
            None
        }
    }

    fn stage(&mut self, staged: StagedSample) {
        let mut state = self.state.lock();
        let timestamp = staged.sample.timestamp;
        state.latest_timestamp =
            Some(state.latest_timestamp.map_or(timestamp, |t| t.max(timestamp)));
        state.staging.push_back(staged);

        if state.staging.len() > self.config.max_buffered {
            if let Some(lost) = state.staging.pop_front() {
                state.dropped += 1;
                state.cache.clear();
                log::error!(
                    "Sample buffer full ({} samples), dropping sample at {}",
                    self.config.max_buffered,
                    lost.sample.timestamp
                );
            }
        }
    }

    fn connection(&mut self) -> Result<&mut Connection, StoreError> {
        if self.conn.is_none() {
            let (conn, max_id, max_ts) = open_writer(&self.config.database)?;
            let mut state = self.state.lock();
            state.committed_id = state.committed_id.max(max_id);
            state.latest_timestamp = match (state.latest_timestamp, max_ts) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            drop(state);
            self.conn = Some(conn);
        }
        self.conn.as_mut().ok_or(StoreError::WriterUnavailable)
    }

    /// Nothing to write, but find out whether the database is back
    fn reopen(&mut self) {
        match self.connection() {
            Ok(_) => {
                self.state.lock().degraded = false;
                log::info!("Persistence recovered");
            }
            Err(e) => log::debug!("Persistence still unavailable: {}", e),
        }
    }

    fn write_batch(&mut self, batch: &[StagedSample]) -> Result<i64, StoreError> {
        let conn = self.connection()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO samples (timestamp, bpm, source, device_address)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for staged in batch {
                stmt.execute(params![
                    staged.sample.timestamp,
                    staged.sample.bpm,
                    staged.sample.source.as_str(),
                    staged.device_address,
                ])?;
            }
        }
        let last_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(last_id)
    }

    /// Write the staging buffer in one transaction.
    ///
    /// The buffer is copied so readers are never blocked on disk I/O; the
    /// committed prefix is removed and the high-water mark raised under one
    /// lock so readers never see a sample both staged and committed.
    fn commit(&mut self) {
        let batch: Vec<StagedSample> = {
            let state = self.state.lock();
            if state.staging.is_empty() {
                if state.degraded {
                    drop(state);
                    self.reopen();
                }
                return;
            }
            state.staging.iter().cloned().collect()
        };

        match self.write_batch(&batch) {
            Ok(last_id) => {
                let mut state = self.state.lock();
                state.staging.drain(..batch.len());
                state.committed_id = last_id;
                if state.degraded {
                    state.degraded = false;
                    log::info!("Persistence recovered, wrote {} buffered samples", batch.len());
                } else {
                    log::debug!("Committed {} samples", batch.len());
                }
            }
            Err(e) => {
                self.conn = None;
                let mut state = self.state.lock();
                if !state.degraded {
                    state.degraded = true;
                    log::warn!("{}", StoreError::PersistenceUnavailable(e.to_string()));
                } else {
                    log::debug!(
                        "Persistence retry failed ({} buffered): {}",
                        state.staging.len(),
                        e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            database: dir.path().join("heart_rate.db"),
            retry_interval_ms: 20,
            max_buffered: 1_000,
            page_size: 2,
            cache_entries: 8,
        }
    }

    fn real(timestamp: i64, bpm: u16) -> Sample {
        Sample::new(timestamp, bpm, Source::Real)
    }

    fn collect(cursor: RawCursor) -> Vec<Sample> {
        cursor.collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn test_raw_and_minute_scenario() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));

        store.append(real(0, 72), Some("AA:BB".to_string()));
        store.append(real(1_000, 75), Some("AA:BB".to_string()));
        store.append(real(2_000, 74), Some("AA:BB".to_string()));
        store.flush(WAIT).unwrap();

        let raw = collect(store.query_raw(0, 3_000));
        let pairs: Vec<(i64, u16)> = raw.iter().map(|s| (s.timestamp, s.bpm)).collect();
        assert_eq!(pairs, vec![(0, 72), (1_000, 75), (2_000, 74)]);

        let buckets = store.query_aggregate(0, 60_000, Granularity::Minute).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 3);
        assert!((buckets[0].avg_bpm - 73.67).abs() < 0.01);
    }

    #[test]
    fn test_raw_range_is_half_open_and_paged() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));

        for i in 0..7 {
            store.append(real(i * 100, 60 + i as u16), None);
        }
        store.flush(WAIT).unwrap();

        // page size 2 forces several round trips
        let raw = collect(store.query_raw(100, 600));
        let stamps: Vec<i64> = raw.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![100, 200, 300, 400, 500]);
    }

    #[test]
    fn test_duplicate_timestamps_survive_paging() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));

        for bpm in [70, 71, 72, 73, 74] {
            store.append(real(500, bpm), None);
        }
        store.flush(WAIT).unwrap();

        let bpms: Vec<u16> = collect(store.query_raw(0, 1_000)).iter().map(|s| s.bpm).collect();
        assert_eq!(bpms, vec![70, 71, 72, 73, 74]);
    }

    #[test]
    fn test_empty_ranges_return_nothing() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));
        store.append(real(1_000, 80), None);
        store.flush(WAIT).unwrap();

        assert!(collect(store.query_raw(5_000, 9_000)).is_empty());
        assert!(collect(store.query_raw(9_000, 5_000)).is_empty());
        assert!(store.query_aggregate(5_000, 9_000, Granularity::Hour).unwrap().is_empty());
        assert!(store.query_raw_tail(5_000, 9_000, 10).unwrap().is_empty());
    }

    #[test]
    fn test_aggregate_counts_and_means_per_bucket() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));

        let samples = [
            (10_000, 60),
            (50_000, 70),
            (61_000, 90),
            (119_999, 100),
            (180_000, 65),
        ];
        for (ts, bpm) in samples {
            store.append(real(ts, bpm), None);
        }
        store.flush(WAIT).unwrap();

        let buckets = store.query_aggregate(0, 240_000, Granularity::Minute).unwrap();
        let starts: Vec<i64> = buckets.iter().map(|b| b.bucket_start).collect();
        // the empty minute at 120_000 is omitted
        assert_eq!(starts, vec![0, 60_000, 180_000]);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), samples.len() as u64);
        assert_eq!(buckets[0].avg_bpm, 65.0);
        assert_eq!(buckets[1].avg_bpm, 95.0);
        assert_eq!(buckets[2].avg_bpm, 65.0);

        let hours = store.query_aggregate(0, 240_000, Granularity::Hour).unwrap();
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].count, 5);
    }

    #[test]
    fn test_raw_tail_returns_latest_in_order() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));
        for i in 0..10 {
            store.append(real(i * 1_000, 60 + i as u16), None);
        }
        store.flush(WAIT).unwrap();

        let tail = store.query_raw_tail(0, 100_000, 3).unwrap();
        let stamps: Vec<i64> = tail.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![7_000, 8_000, 9_000]);
    }

    #[test]
    fn test_source_tag_is_persisted() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));
        store.append(Sample::new(1, 90, Source::Mock), None);
        store.append(real(2, 91), Some("AA".to_string()));
        store.flush(WAIT).unwrap();

        let sources: Vec<Source> = collect(store.query_raw(0, 10))
            .iter()
            .map(|s| s.source)
            .collect();
        assert_eq!(sources, vec![Source::Mock, Source::Real]);
    }

    #[test]
    fn test_samples_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        {
            let store = SampleStore::open(&config);
            store.append(real(1_000, 80), None);
            store.shutdown(WAIT);
        }

        let store = SampleStore::open(&config);
        store.append(real(2_000, 81), None);
        store.flush(WAIT).unwrap();
        assert_eq!(collect(store.query_raw(0, 10_000)).len(), 2);
    }

    #[test]
    fn test_degraded_store_buffers_and_recovers() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let mut config = test_config(&dir);
        config.database = blocker.join("heart_rate.db");
        let store = SampleStore::open(&config);
        assert!(store.is_degraded());

        store.append(real(1_000, 70), None);
        store.append(real(2_000, 72), None);
        assert!(store.flush(WAIT).is_err());
        assert_eq!(store.pending(), 2);

        // buffered samples are still visible to queries
        let raw = collect(store.query_raw(0, 10_000));
        assert_eq!(raw.len(), 2);
        let buckets = store.query_aggregate(0, 60_000, Granularity::Minute).unwrap();
        assert_eq!(buckets[0].count, 2);

        std::fs::remove_file(&blocker).unwrap();
        store.flush(WAIT).unwrap();
        assert!(!store.is_degraded());
        assert_eq!(store.pending(), 0);

        // committed exactly once
        let raw = collect(store.query_raw(0, 10_000));
        assert_eq!(raw.len(), 2);
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();

        let mut config = test_config(&dir);
        config.database = blocker.join("heart_rate.db");
        config.max_buffered = 3;
        let store = SampleStore::open(&config);

        for i in 0..5 {
            store.append(real(i, 70), None);
        }
        let _ = store.flush(WAIT);

        assert_eq!(store.pending(), 3);
        assert_eq!(store.dropped(), 2);
        let stamps: Vec<i64> = collect(store.query_raw(0, 10))
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(stamps, vec![2, 3, 4]);
    }

    #[test]
    fn test_degraded_writer_retries_on_its_interval() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();

        let mut config = test_config(&dir);
        config.database = blocker.join("heart_rate.db");
        config.retry_interval_ms = 60_000;
        let store = SampleStore::open(&config);
        assert!(store.is_degraded());
        std::fs::remove_file(&blocker).unwrap();

        for i in 0..3 {
            store.append(real(i * 1_000, 70), None);
        }
        let deadline = Instant::now() + WAIT;
        while store.pending() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        // appends alone do not hit the database before the next retry
        assert_eq!(store.pending(), 3);
        assert!(store.is_degraded());

        store.flush(WAIT).unwrap();
        assert!(!store.is_degraded());
        assert_eq!(collect(store.query_raw(0, 10_000)).len(), 3);
    }

    #[test]
    fn test_flush_succeeds_while_producer_keeps_appending() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));
        let running = Arc::new(AtomicBool::new(true));

        let producer = {
            let store = store.clone();
            let running = running.clone();
            thread::spawn(move || {
                let mut appended = 0u64;
                while running.load(Ordering::Relaxed) {
                    store.append(real(appended as i64, 70), None);
                    appended += 1;
                    thread::sleep(Duration::from_micros(50));
                }
                appended
            })
        };

        for _ in 0..200 {
            store.flush(WAIT).unwrap();
        }
        running.store(false, Ordering::Relaxed);
        let appended = producer.join().unwrap();

        store.flush(WAIT).unwrap();
        let buckets = store.query_aggregate(0, i64::MAX, Granularity::Day).unwrap();
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), appended);
    }

    #[test]
    fn test_shutdown_detaches_a_stuck_writer() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));

        // hold the shared state so the writer blocks on its next sample
        let state = store.inner.state.clone();
        let (locked_tx, locked_rx) = bounded(0);
        let holder = thread::spawn(move || {
            let _guard = state.lock();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        locked_rx.recv().unwrap();
        store.append(real(1_000, 70), None);

        let started = Instant::now();
        store.shutdown(Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(store.inner.writer_thread.lock().is_none());

        holder.join().unwrap();
        drop(store);
    }

    #[test]
    fn test_closed_range_aggregates_are_cached() {
        let dir = tempdir().unwrap();
        let store = SampleStore::open(&test_config(&dir));
        store.append(real(1_000, 60), None);
        store.append(real(70_000, 80), None);
        store.flush(WAIT).unwrap();

        let first = store.query_aggregate(0, 60_000, Granularity::Minute).unwrap();
        assert!(store.inner.state.lock().cache.contains(&(Granularity::Minute, 0, 60_000)));
        let second = store.query_aggregate(0, 60_000, Granularity::Minute).unwrap();
        assert_eq!(first, second);

        // still open: not cached
        store.query_aggregate(0, 120_000, Granularity::Minute).unwrap();
        assert!(!store.inner.state.lock().cache.contains(&(Granularity::Minute, 0, 120_000)));
    }
}
