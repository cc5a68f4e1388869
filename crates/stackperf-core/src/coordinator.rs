//! Store coordinator: owns one SQLite store file and brokers every physical
//! read and write against it.
//!
//! **Read path**: RAM-first. Committed rows are mirrored in an ordered map
//! behind an RwLock, so any number of contexts read concurrently without
//! touching SQLite.
//! **Write path**: SQLite-first. Commits serialize on the writer Mutex, run
//! as one SQLite transaction, and only then update the RAM mirror.
//! **Notifications**: after a commit, a `SaveNotification` carrying the
//! delta is handed to every subscribed context, which merges it on its own
//! lane.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::context::ContextId;
use crate::error::{SaveError, SaveResult, StoreOpenError};
use crate::record::Record;
use crate::schema::{load_schema, Schema, SchemaSource};

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Changes committed together, all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Records inserted, ascending by number
    pub inserted: Vec<Record>,
}

impl ChangeSet {
    /// True when there is nothing to commit.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
    }

    /// Number of changed records.
    pub fn len(&self) -> usize {
        self.inserted.len()
    }
}

/// Delivered to subscribers after a successful physical commit.
#[derive(Debug, Clone)]
pub struct SaveNotification {
    /// Context whose save produced the commit
    pub origin: ContextId,
    /// Coordinator commit sequence, starting at 1
    pub sequence: u64,
    /// The committed delta
    pub changes: ChangeSet,
}

/// Result of one physical commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Commit sequence assigned by the coordinator
    pub sequence: u64,
    /// Records written
    pub inserted: usize,
}

/// Which commits a subscriber wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFilter {
    /// Only commits made by this one context
    Context(ContextId),
    /// Every commit not made by the subscriber itself
    AnyOther,
}

impl SourceFilter {
    fn accepts(&self, origin: ContextId, subscriber: ContextId) -> bool {
        match self {
            SourceFilter::Context(id) => *id == origin,
            SourceFilter::AnyOther => origin != subscriber,
        }
    }
}

/// Receives save notifications. Implementations must not block: delivery
/// happens on the committing context's lane.
pub trait ChangeObserver: Send + Sync {
    /// Identity used for subscription bookkeeping and self-filtering.
    fn observer_id(&self) -> ContextId;

    /// Hand over a notification for asynchronous processing.
    fn deliver(self: Arc<Self>, notification: Arc<SaveNotification>);
}

struct Subscription {
    observer: Weak<dyn ChangeObserver>,
    filter: SourceFilter,
}

/// Retry behavior for transient commit failures.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
}

/// One store file plus its schema, RAM mirror and subscriber registry.
///
/// All public methods take `&self`; share it as `Arc<Coordinator>`.
pub struct Coordinator {
    id: u64,
    /// RAM mirror of committed rows, keyed by number
    rows: RwLock<BTreeMap<i32, Record>>,
    /// SQLite connection, single writer via Mutex
    writer: Mutex<Connection>,
    /// Subscribers keyed by their context id
    subscribers: Mutex<HashMap<ContextId, Subscription>>,
    /// Successful physical commits
    commits: AtomicU64,
    /// Commit attempts repeated after a transient failure
    retries: AtomicU64,
    /// Store file path
    path: PathBuf,
    /// Schema the store was attached with
    schema: Schema,
    retry: RetryPolicy,
}

impl Coordinator {
    /// Open or create the store at `path` and bind it to the schema.
    ///
    /// Loads all committed rows into RAM. Every call produces an independent
    /// coordinator, even for a path another coordinator already has open.
    pub fn open<P: AsRef<Path>>(
        source: &SchemaSource,
        path: P,
        config: &StackConfig,
    ) -> Result<Arc<Self>, StoreOpenError> {
        let path = path.as_ref().to_path_buf();
        let schema = load_schema(source)?;

        let attach = |cause: String| StoreOpenError::Attach {
            path: path.clone(),
            cause,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| attach(format!("cannot create store directory: {}", e)))?;
        }

        let conn = Connection::open(&path).map_err(|e| attach(e.to_string()))?;
        // Busy handling is left to the commit retry policy
        conn.busy_timeout(Duration::ZERO)
            .map_err(|e| attach(format!("cannot set busy timeout: {}", e)))?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| attach(format!("cannot enable WAL journal: {}", e)))?;

        schema.apply(&conn)?;

        let rows = load_rows(&conn).map_err(|e| attach(format!("cannot load rows: {}", e)))?;
        let mut mirror = BTreeMap::new();
        for (number, start_ms, end_ms, valid) in rows {
            let record = Record::from_columns(number, start_ms, end_ms, valid)
                .ok_or_else(|| attach(format!("record {} has an unrepresentable timestamp", number)))?;
            mirror.insert(number, record);
        }

        let id = NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            coordinator = id,
            path = %path.display(),
            schema = %schema.name,
            rows = mirror.len(),
            "store attached"
        );

        Ok(Arc::new(Self {
            id,
            rows: RwLock::new(mirror),
            writer: Mutex::new(conn),
            subscribers: Mutex::new(HashMap::new()),
            commits: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            path,
            schema,
            retry: RetryPolicy {
                attempts: config.commit_retries,
                backoff: config.retry_backoff,
            },
        }))
    }

    /// Commit a change set on behalf of `origin`.
    ///
    /// WRITE ORDERING:
    /// 1. SQLite transaction (retried on busy/locked)
    /// 2. RAM mirror update
    /// 3. Notification handed to subscribers
    ///
    /// All three happen under the writer lock, so subscribers see commits in
    /// sequence order. If step 1 fails, RAM is never modified.
    pub(crate) fn commit(&self, origin: ContextId, changes: ChangeSet) -> SaveResult<CommitReceipt> {
        let inserted = changes.len();
        let mut targets = Vec::new();

        let sequence = {
            let mut conn = self.writer.lock();
            let mut attempt = 0;
            loop {
                match write_changes(&mut conn, &changes) {
                    Ok(()) => break,
                    Err(err) => {
                        let err = SaveError::from_sqlite(&self.path, err);
                        if err.is_transient() && attempt < self.retry.attempts {
                            attempt += 1;
                            self.retries.fetch_add(1, Ordering::Relaxed);
                            warn!(coordinator = self.id, attempt, %err, "commit busy, retrying");
                            thread::sleep(self.retry.backoff * attempt);
                            continue;
                        }
                        return Err(err);
                    }
                }
            }

            {
                let mut rows = self.rows.write();
                for record in &changes.inserted {
                    rows.insert(record.number, record.clone());
                }
            }

            let sequence = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
            let notification = Arc::new(SaveNotification { origin, sequence, changes });
            for observer in self.matching_observers(origin) {
                Arc::clone(&observer).deliver(Arc::clone(&notification));
                targets.push(observer);
            }
            sequence
        };
        // Observers may hold the last reference to a context; release them
        // outside the writer lock
        drop(targets);

        debug!(coordinator = self.id, %origin, sequence, inserted, "commit");
        Ok(CommitReceipt { sequence, inserted })
    }

    /// Register `observer` for notifications matching `filter`. A context
    /// holds at most one subscription per coordinator; subscribing again
    /// replaces the filter.
    pub fn subscribe(&self, observer: Weak<dyn ChangeObserver>, filter: SourceFilter) {
        let Some(strong) = observer.upgrade() else { return };
        let id = strong.observer_id();
        self.subscribers.lock().insert(id, Subscription { observer, filter });
        debug!(coordinator = self.id, subscriber = %id, ?filter, "subscribed");
    }

    fn matching_observers(&self, origin: ContextId) -> Vec<Arc<dyn ChangeObserver>> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, s| s.observer.strong_count() > 0);
        subscribers
            .iter()
            .filter(|(id, s)| s.filter.accepts(origin, **id))
            .filter_map(|(_, s)| s.observer.upgrade())
            .collect()
    }

    /// Committed rows with numbers in `range`, ascending.
    ///
    /// Acquires a read lock, concurrent with other readers.
    pub fn fetch_range(&self, range: RangeInclusive<i32>) -> Vec<Record> {
        let rows = self.rows.read();
        rows.range(range).map(|(_, r)| r.clone()).collect()
    }

    /// Copy of every committed row, keyed by number.
    pub fn snapshot(&self) -> BTreeMap<i32, Record> {
        self.rows.read().clone()
    }

    /// Number of committed rows.
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Successful physical commits since open.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Commit attempts repeated after a busy or locked store since open.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, s| s.observer.strong_count() > 0);
        subscribers.len()
    }

    /// Store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema the store was attached with.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Process-unique coordinator id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("rows", &self.row_count())
            .field("commits", &self.commit_count())
            .field("retries", &self.retry_count())
            .finish()
    }
}

fn load_rows(conn: &Connection) -> rusqlite::Result<Vec<(i32, i64, i64, bool)>> {
    let mut stmt = conn.prepare("SELECT number, start_ms, end_ms, valid FROM sessions ORDER BY number")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write_changes(conn: &mut Connection, changes: &ChangeSet) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO sessions (number, start_ms, end_ms, valid) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for record in &changes.inserted {
            stmt.execute(params![record.number, record.start_millis(), record.end_millis(), record.valid])?;
        }
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_coordinator() -> (Arc<Coordinator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        (coordinator, dir)
    }

    fn changes(numbers: impl IntoIterator<Item = i32>) -> ChangeSet {
        let epoch = Utc::now();
        ChangeSet {
            inserted: numbers.into_iter().map(|n| Record::synthesize(n, epoch)).collect(),
        }
    }

    struct Recorder {
        id: ContextId,
        seen: Mutex<Vec<u64>>,
    }

    impl ChangeObserver for Recorder {
        fn observer_id(&self) -> ContextId {
            self.id
        }

        fn deliver(self: Arc<Self>, notification: Arc<SaveNotification>) {
            self.seen.lock().push(notification.sequence);
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder { id: ContextId::next(), seen: Mutex::new(Vec::new()) })
    }

    #[test]
    fn test_open_empty() {
        let (coordinator, _dir) = test_coordinator();
        assert_eq!(coordinator.row_count(), 0);
        assert_eq!(coordinator.commit_count(), 0);
        assert!(coordinator.path().exists());
    }

    #[test]
    fn test_commit_then_fetch() {
        let (coordinator, _dir) = test_coordinator();
        let receipt = coordinator.commit(ContextId::next(), changes([3, 1, 2])).unwrap();
        assert_eq!(receipt, CommitReceipt { sequence: 1, inserted: 3 });

        let numbers: Vec<i32> = coordinator.fetch_range(0..=2).iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(coordinator.row_count(), 3);
    }

    #[test]
    fn test_reopen_recovers_rows() {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        {
            let c = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
            c.commit(ContextId::next(), changes(0..5)).unwrap();
        }
        let c = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        assert_eq!(c.row_count(), 5);
        assert!(c.fetch_range(4..=4)[0].valid);
    }

    #[test]
    fn test_constraint_violation_is_atomic() {
        let (coordinator, _dir) = test_coordinator();
        coordinator.commit(ContextId::next(), changes([5])).unwrap();

        let err = coordinator.commit(ContextId::next(), changes([4, 5, 6])).unwrap_err();
        assert!(matches!(err, SaveError::Constraint { .. }));
        assert_eq!(coordinator.row_count(), 1);
        assert_eq!(coordinator.commit_count(), 1);

        // Nothing from the failed change set reached the file either
        drop(coordinator);
        let config = StackConfig::quick(_dir.path());
        let reopened = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        assert_eq!(reopened.row_count(), 1);
    }

    #[test]
    fn test_busy_store_retries_then_fails_transient() {
        let dir = TempDir::new().unwrap();
        let mut config = StackConfig::quick(dir.path());
        config.commit_retries = 2;
        config.retry_backoff = Duration::from_millis(1);
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();

        // Another connection takes the write lock and keeps it
        let other = Connection::open(config.store_path()).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        let err = coordinator.commit(ContextId::next(), changes([1, 2])).unwrap_err();
        assert!(matches!(err, SaveError::Io { transient: true, .. }));
        assert_eq!(coordinator.retry_count(), 2);
        assert_eq!(coordinator.commit_count(), 0);
        assert_eq!(coordinator.row_count(), 0);
        // No driver-level busy wait on top of the retry policy
        assert!(started.elapsed() < Duration::from_secs(1));

        other.execute_batch("COMMIT").unwrap();
        let receipt = coordinator.commit(ContextId::next(), changes([1, 2])).unwrap();
        assert_eq!(receipt.sequence, 1);
        assert_eq!(coordinator.retry_count(), 2);
    }

    #[test]
    fn test_notifications_follow_filters() {
        let (coordinator, _dir) = test_coordinator();
        let writer = ContextId::next();
        let peer = recorder();
        let everyone = recorder();

        let weak_peer: Weak<dyn ChangeObserver> = Arc::downgrade(&peer) as Weak<dyn ChangeObserver>;
        let weak_everyone: Weak<dyn ChangeObserver> = Arc::downgrade(&everyone) as Weak<dyn ChangeObserver>;
        coordinator.subscribe(weak_peer, SourceFilter::Context(writer));
        coordinator.subscribe(weak_everyone, SourceFilter::AnyOther);

        coordinator.commit(writer, changes([1])).unwrap();
        coordinator.commit(ContextId::next(), changes([2])).unwrap();
        coordinator.commit(everyone.id, changes([3])).unwrap();

        assert_eq!(*peer.seen.lock(), vec![1]);
        assert_eq!(*everyone.seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_dead_subscribers_pruned() {
        let (coordinator, _dir) = test_coordinator();
        let observer = recorder();
        let weak: Weak<dyn ChangeObserver> = Arc::downgrade(&observer) as Weak<dyn ChangeObserver>;
        coordinator.subscribe(weak, SourceFilter::AnyOther);
        assert_eq!(coordinator.subscriber_count(), 1);

        drop(observer);
        coordinator.commit(ContextId::next(), changes([1])).unwrap();
        assert_eq!(coordinator.subscriber_count(), 0);
    }

    #[test]
    fn test_concurrent_reads() {
        let (coordinator, _dir) = test_coordinator();
        coordinator.commit(ContextId::next(), changes(0..100)).unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let c = Arc::clone(&coordinator);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    assert_eq!(c.fetch_range(i..=i)[0].number, i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
