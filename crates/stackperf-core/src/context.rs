//! Contexts: unit-of-work object graphs confined to one lane.
//!
//! A `Context` handle can be cloned and sent anywhere, but its object graph
//! (pending inserts, pinned snapshot) is only reachable through `perform` and
//! `perform_and_wait`. Both run the closure on the context's own lane and
//! hand it a `Scope`, the sole API for reading and mutating that graph.
//!
//! A context is attached either to a coordinator or to a parent context:
//!
//! - `Store { view: Live }` fetches read the coordinator's current rows.
//! - `Store { view: Isolated }` fetches read a snapshot pinned at creation,
//!   advanced only by the context's own saves and by merges.
//! - `Parent(..)` fetches read whatever the parent would return, overlaid
//!   with the child's pending inserts. Saving pushes the inserts into the
//!   parent's pending set; nothing reaches the store until an ancestor
//!   attached to the coordinator saves.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::coordinator::{ChangeObserver, ChangeSet, Coordinator, SaveNotification, SourceFilter};
use crate::error::{FetchError, LaneError, SaveError, SaveResult};
use crate::lane::Lane;
use crate::record::Record;
use crate::save::SaveOutcome;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique context identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// What a context is used for within its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    /// Read side
    Main,
    /// Write side
    Worker,
    /// Hidden top of a nested chain, the only level touching the store
    PrivateTop,
}

impl ContextRole {
    fn label(&self) -> &'static str {
        match self {
            ContextRole::Main => "main",
            ContextRole::Worker => "worker",
            ContextRole::PrivateTop => "private",
        }
    }
}

/// How a store-attached context sees committed rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreView {
    /// Every fetch reads the coordinator's current state
    Live,
    /// Fetches read a snapshot pinned when the context was created
    Isolated,
}

enum Attachment {
    Store {
        coordinator: Arc<Coordinator>,
        view: StoreView,
    },
    Parent(Context),
}

/// Counters readable from any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Calls to save, including no-op saves
    pub saves_requested: u64,
    /// Saves that moved changes to the parent or the store
    pub saves_committed: u64,
    /// Saves that returned an error
    pub saves_failed: u64,
    /// Notifications merged into this context
    pub merges_applied: u64,
    /// Records inserted through this context
    pub records_inserted: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    saves_requested: AtomicU64,
    saves_committed: AtomicU64,
    saves_failed: AtomicU64,
    merges_applied: AtomicU64,
    records_inserted: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn load(&self) -> ContextStats {
        ContextStats {
            saves_requested: self.saves_requested.load(Ordering::Relaxed),
            saves_committed: self.saves_committed.load(Ordering::Relaxed),
            saves_failed: self.saves_failed.load(Ordering::Relaxed),
            merges_applied: self.merges_applied.load(Ordering::Relaxed),
            records_inserted: self.records_inserted.load(Ordering::Relaxed),
        }
    }
}

/// The object graph. Only ever locked from the owning lane.
#[derive(Default)]
struct ContextState {
    /// Inserted and not yet saved, keyed by number
    pending: BTreeMap<i32, Record>,
    /// Pinned committed rows, used by isolated views only
    snapshot: BTreeMap<i32, Record>,
    /// Sequence of the last merged notification
    last_merged: Option<u64>,
}

/// Handle to a lane-confined context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: ContextId,
    role: ContextRole,
    lane: Lane,
    attachment: Attachment,
    state: Mutex<ContextState>,
    stats: StatsCounters,
    /// Most recent save failure, readable from any thread
    last_save_error: Mutex<Option<SaveError>>,
}

impl Context {
    /// New context attached directly to `coordinator`, on a fresh lane.
    pub fn attached(role: ContextRole, coordinator: &Arc<Coordinator>, view: StoreView) -> Result<Self, LaneError> {
        let mut state = ContextState::default();
        if view == StoreView::Isolated {
            state.snapshot = coordinator.snapshot();
        }
        let attachment = Attachment::Store {
            coordinator: Arc::clone(coordinator),
            view,
        };
        Self::build(role, attachment, state)
    }

    /// New context whose parent is `parent`, on a fresh lane.
    pub fn child_of(role: ContextRole, parent: &Context) -> Result<Self, LaneError> {
        Self::build(role, Attachment::Parent(parent.clone()), ContextState::default())
    }

    fn build(role: ContextRole, attachment: Attachment, state: ContextState) -> Result<Self, LaneError> {
        let id = ContextId::next();
        let lane = Lane::spawn(format!("{}-{}", role.label(), id.0))?;
        trace!(context = %id, role = role.label(), "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                role,
                lane,
                attachment,
                state: Mutex::new(state),
                stats: StatsCounters::default(),
                last_save_error: Mutex::new(None),
            }),
        })
    }

    /// Run `job` on this context's lane without waiting for it.
    pub fn perform<F>(&self, job: F) -> Result<(), LaneError>
    where
        F: FnOnce(&mut Scope<'_>) + Send + 'static,
    {
        let context = self.clone();
        self.inner.lane.perform(move || context.enter(job))
    }

    /// Run `job` on this context's lane and wait for its result.
    pub fn perform_and_wait<F, R>(&self, job: F) -> Result<R, LaneError>
    where
        F: FnOnce(&mut Scope<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let context = self.clone();
        self.inner.lane.perform_and_wait(move || context.enter(job))
    }

    fn enter<F, R>(&self, job: F) -> R
    where
        F: FnOnce(&mut Scope<'_>) -> R,
    {
        let mut state = self.inner.state.lock();
        let mut scope = Scope {
            context: self,
            state: &mut *state,
        };
        job(&mut scope)
    }

    /// Subscribe this context to `coordinator` notifications matching
    /// `filter`; each one is merged on this context's lane.
    pub fn subscribe_to(&self, coordinator: &Coordinator, filter: SourceFilter) {
        let weak: Weak<ContextInner> = Arc::downgrade(&self.inner);
        coordinator.subscribe(weak as Weak<dyn ChangeObserver>, filter);
    }

    /// Context identity.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Role within the topology.
    pub fn role(&self) -> ContextRole {
        self.inner.role
    }

    /// Name of the lane this context is bound to.
    pub fn lane_name(&self) -> &str {
        self.inner.lane.name()
    }

    /// Parent context, for nested attachments.
    pub fn parent(&self) -> Option<&Context> {
        match &self.inner.attachment {
            Attachment::Parent(parent) => Some(parent),
            Attachment::Store { .. } => None,
        }
    }

    /// Coordinator, for store attachments.
    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        match &self.inner.attachment {
            Attachment::Store { coordinator, .. } => Some(coordinator),
            Attachment::Parent(_) => None,
        }
    }

    /// View kind, for store attachments.
    pub fn view(&self) -> Option<StoreView> {
        match &self.inner.attachment {
            Attachment::Store { view, .. } => Some(*view),
            Attachment::Parent(_) => None,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ContextStats {
        self.inner.stats.load()
    }

    /// The most recent failed save on this context, including saves run in
    /// the background by propagation.
    pub fn last_save_error(&self) -> Option<SaveError> {
        self.inner.last_save_error.lock().clone()
    }

    /// Parent, grandparent and so on, nearest first.
    pub fn ancestors(&self) -> Vec<Context> {
        let mut chain = Vec::new();
        let mut next = self.parent();
        while let Some(parent) = next {
            chain.push(parent.clone());
            next = parent.parent();
        }
        chain
    }

    /// Whether two handles refer to the same context.
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("lane", &self.inner.lane.name())
            .field("parent", &self.parent().map(|p| p.id()))
            .finish()
    }
}

impl ChangeObserver for ContextInner {
    fn observer_id(&self) -> ContextId {
        self.id
    }

    fn deliver(self: Arc<Self>, notification: Arc<SaveNotification>) {
        let context = Context { inner: self };
        let id = context.id();
        let queued = context.perform(move |scope| {
            scope.merge(&notification);
        });
        if let Err(err) = queued {
            warn!(context = %id, %err, "dropped save notification");
        }
    }
}

/// Access to a context's object graph, only available on its lane.
pub struct Scope<'a> {
    context: &'a Context,
    state: &'a mut ContextState,
}

impl Scope<'_> {
    /// The context this scope belongs to.
    pub fn context(&self) -> &Context {
        self.context
    }

    /// Context identity.
    pub fn id(&self) -> ContextId {
        self.context.id()
    }

    /// Parent context, for nested attachments.
    pub fn parent(&self) -> Option<&Context> {
        self.context.parent()
    }

    /// Register a new record. Replaces a pending insert with the same number.
    pub fn insert(&mut self, record: Record) {
        self.state.pending.insert(record.number, record);
        StatsCounters::bump(&self.context.inner.stats.records_inserted, 1);
    }

    /// True when there are unsaved changes.
    pub fn has_changes(&self) -> bool {
        !self.state.pending.is_empty()
    }

    /// Number of unsaved records.
    pub fn pending_count(&self) -> usize {
        self.state.pending.len()
    }

    /// Records with `start <= number < start + batch_size`, ascending.
    pub fn fetch(&self, start: i32, batch_size: i32) -> Result<Vec<Record>, FetchError> {
        let invalid = FetchError::InvalidRange { start, batch_size };
        if batch_size <= 0 {
            return Err(invalid);
        }
        let last = start.checked_add(batch_size - 1).ok_or(invalid)?;
        self.rows_in(start..=last)
    }

    /// Every record visible to this context, ascending.
    pub fn fetch_all(&self) -> Result<Vec<Record>, FetchError> {
        self.rows_in(i32::MIN..=i32::MAX)
    }

    /// Number of records visible to this context.
    pub fn count(&self) -> Result<usize, FetchError> {
        self.fetch_all().map(|rows| rows.len())
    }

    fn rows_in(&self, range: RangeInclusive<i32>) -> Result<Vec<Record>, FetchError> {
        let base = match &self.context.inner.attachment {
            Attachment::Store { coordinator, view: StoreView::Live } => coordinator.fetch_range(range.clone()),
            Attachment::Store { view: StoreView::Isolated, .. } => {
                self.state.snapshot.range(range.clone()).map(|(_, r)| r.clone()).collect()
            }
            Attachment::Parent(parent) => {
                let parent_range = range.clone();
                parent.perform_and_wait(move |p| p.rows_in(parent_range))??
            }
        };

        if self.state.pending.is_empty() {
            return Ok(base);
        }
        let mut merged: BTreeMap<i32, Record> = base.into_iter().map(|r| (r.number, r)).collect();
        for (number, record) in self.state.pending.range(range) {
            merged.insert(*number, record.clone());
        }
        Ok(merged.into_values().collect())
    }

    /// Persist pending changes one level up: into the parent's pending set,
    /// or into the store for store-attached contexts.
    ///
    /// No-op when clean. On failure the pending set is left untouched and
    /// the error is kept as the context's last save error.
    pub fn save(&mut self) -> SaveResult<SaveOutcome> {
        StatsCounters::bump(&self.context.inner.stats.saves_requested, 1);
        if !self.has_changes() {
            return Ok(SaveOutcome::Clean);
        }
        let result = self.save_pending();
        if let Err(err) = &result {
            StatsCounters::bump(&self.context.inner.stats.saves_failed, 1);
            *self.context.inner.last_save_error.lock() = Some(err.clone());
        }
        result
    }

    fn save_pending(&mut self) -> SaveResult<SaveOutcome> {
        let stats = &self.context.inner.stats;

        let changes = ChangeSet {
            inserted: self.state.pending.values().cloned().collect(),
        };
        let count = changes.len();

        let outcome = match &self.context.inner.attachment {
            Attachment::Store { coordinator, view } => {
                let receipt = coordinator.commit(self.id(), changes)?;
                let committed = std::mem::take(&mut self.state.pending);
                if *view == StoreView::Isolated {
                    self.state.snapshot.extend(committed);
                }
                SaveOutcome::Committed(receipt)
            }
            Attachment::Parent(parent) => {
                parent.perform_and_wait(move |p| p.absorb(changes))?;
                self.state.pending.clear();
                SaveOutcome::Pushed { records: count }
            }
        };

        StatsCounters::bump(&stats.saves_committed, 1);
        debug!(context = %self.id(), records = count, ?outcome, "saved");
        Ok(outcome)
    }

    /// Discard every unsaved record. Returns how many were dropped.
    pub fn rollback(&mut self) -> usize {
        let dropped = self.state.pending.len();
        self.state.pending.clear();
        dropped
    }

    fn absorb(&mut self, changes: ChangeSet) {
        for record in changes.inserted {
            self.state.pending.insert(record.number, record);
        }
    }

    /// Merge another context's committed delta into this context.
    ///
    /// Returns false for notifications this context produced itself. Live
    /// views already read committed rows, so only the bookkeeping changes.
    pub fn merge(&mut self, notification: &SaveNotification) -> bool {
        if notification.origin == self.id() {
            return false;
        }
        if let Attachment::Store { view: StoreView::Isolated, .. } = &self.context.inner.attachment {
            for record in &notification.changes.inserted {
                self.state.snapshot.insert(record.number, record.clone());
            }
        }
        self.state.last_merged = Some(notification.sequence);
        StatsCounters::bump(&self.context.inner.stats.merges_applied, 1);
        trace!(
            context = %self.id(),
            origin = %notification.origin,
            sequence = notification.sequence,
            "merged"
        );
        true
    }

    /// Sequence of the last merged notification.
    pub fn last_merged(&self) -> Option<u64> {
        self.state.last_merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::schema::SchemaSource;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_coordinator() -> (Arc<Coordinator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        (coordinator, dir)
    }

    fn insert_range(context: &Context, numbers: std::ops::Range<i32>) {
        let epoch = Utc::now();
        context
            .perform_and_wait(move |scope| {
                for n in numbers {
                    scope.insert(Record::synthesize(n, epoch));
                }
            })
            .unwrap();
    }

    fn numbers(context: &Context) -> Vec<i32> {
        context
            .perform_and_wait(|scope| scope.fetch_all())
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|r| r.number)
            .collect()
    }

    #[test]
    fn test_pending_visible_before_save() {
        let (coordinator, _dir) = test_coordinator();
        let context = Context::attached(ContextRole::Main, &coordinator, StoreView::Live).unwrap();
        insert_range(&context, 0..3);

        assert_eq!(numbers(&context), vec![0, 1, 2]);
        assert_eq!(coordinator.row_count(), 0);
        assert!(context.perform_and_wait(|s| s.has_changes()).unwrap());
    }

    #[test]
    fn test_save_commits_and_clears() {
        let (coordinator, _dir) = test_coordinator();
        let context = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        insert_range(&context, 0..4);

        let outcome = context.perform_and_wait(|s| s.save()).unwrap().unwrap();
        assert!(matches!(outcome, SaveOutcome::Committed(r) if r.inserted == 4));
        assert_eq!(coordinator.row_count(), 4);
        assert_eq!(context.perform_and_wait(|s| s.pending_count()).unwrap(), 0);
        assert_eq!(context.stats().saves_committed, 1);
        assert_eq!(context.stats().records_inserted, 4);
    }

    #[test]
    fn test_clean_save_is_noop() {
        let (coordinator, _dir) = test_coordinator();
        let context = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();

        let outcome = context.perform_and_wait(|s| s.save()).unwrap().unwrap();
        assert_eq!(outcome, SaveOutcome::Clean);
        assert_eq!(coordinator.commit_count(), 0);
        assert_eq!(context.stats().saves_requested, 1);
        assert_eq!(context.stats().saves_committed, 0);
    }

    #[test]
    fn test_failed_save_keeps_pending() {
        let (coordinator, _dir) = test_coordinator();
        let first = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        insert_range(&first, 0..2);
        first.perform_and_wait(|s| s.save()).unwrap().unwrap();

        let second = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        insert_range(&second, 1..3);
        let err = second.perform_and_wait(|s| s.save()).unwrap().unwrap_err();
        assert!(matches!(err, SaveError::Constraint { .. }));
        assert_eq!(second.perform_and_wait(|s| s.pending_count()).unwrap(), 2);
    }

    #[test]
    fn test_failed_save_is_recorded() {
        let (coordinator, _dir) = test_coordinator();
        let first = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        insert_range(&first, 0..2);
        first.perform_and_wait(|s| s.save()).unwrap().unwrap();
        assert_eq!(first.last_save_error(), None);

        let second = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        insert_range(&second, 0..1);
        second.perform_and_wait(|s| s.save()).unwrap().unwrap_err();
        assert_eq!(second.stats().saves_failed, 1);
        assert!(matches!(second.last_save_error(), Some(SaveError::Constraint { .. })));

        assert_eq!(second.perform_and_wait(|s| s.rollback()).unwrap(), 1);
        assert!(second.perform_and_wait(|s| s.save()).unwrap().unwrap().is_clean());
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let (coordinator, _dir) = test_coordinator();
        let top = Context::attached(ContextRole::PrivateTop, &coordinator, StoreView::Live).unwrap();
        let main = Context::child_of(ContextRole::Main, &top).unwrap();
        let worker = Context::child_of(ContextRole::Worker, &main).unwrap();

        let chain = worker.ancestors();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].same_as(&main));
        assert!(chain[1].same_as(&top));
        assert!(top.ancestors().is_empty());
    }

    #[test]
    fn test_isolated_view_ignores_peer_commits() {
        let (coordinator, _dir) = test_coordinator();
        let reader = Context::attached(ContextRole::Main, &coordinator, StoreView::Isolated).unwrap();
        let writer = Context::attached(ContextRole::Worker, &coordinator, StoreView::Isolated).unwrap();
        insert_range(&writer, 0..3);
        writer.perform_and_wait(|s| s.save()).unwrap().unwrap();

        assert_eq!(numbers(&writer), vec![0, 1, 2]);
        assert!(numbers(&reader).is_empty());
        assert_eq!(coordinator.row_count(), 3);
    }

    #[test]
    fn test_isolated_view_merges_notifications() {
        let (coordinator, _dir) = test_coordinator();
        let reader = Context::attached(ContextRole::Main, &coordinator, StoreView::Isolated).unwrap();
        let writer = Context::attached(ContextRole::Worker, &coordinator, StoreView::Isolated).unwrap();
        reader.subscribe_to(&coordinator, SourceFilter::Context(writer.id()));

        insert_range(&writer, 0..3);
        writer.perform_and_wait(|s| s.save()).unwrap().unwrap();

        // The merge was queued on the reader's lane before this fetch
        assert_eq!(numbers(&reader), vec![0, 1, 2]);
        assert_eq!(reader.stats().merges_applied, 1);
        assert_eq!(reader.perform_and_wait(|s| s.last_merged()).unwrap(), Some(1));
    }

    #[test]
    fn test_child_save_pushes_into_parent() {
        let (coordinator, _dir) = test_coordinator();
        let parent = Context::attached(ContextRole::Main, &coordinator, StoreView::Live).unwrap();
        let child = Context::child_of(ContextRole::Worker, &parent).unwrap();
        insert_range(&child, 0..5);

        let outcome = child.perform_and_wait(|s| s.save()).unwrap().unwrap();
        assert_eq!(outcome, SaveOutcome::Pushed { records: 5 });
        assert_eq!(parent.perform_and_wait(|s| s.pending_count()).unwrap(), 5);
        assert_eq!(numbers(&parent), vec![0, 1, 2, 3, 4]);
        assert_eq!(coordinator.row_count(), 0);
    }

    #[test]
    fn test_child_sees_parent_pending() {
        let (coordinator, _dir) = test_coordinator();
        let parent = Context::attached(ContextRole::Main, &coordinator, StoreView::Live).unwrap();
        insert_range(&parent, 10..12);
        let child = Context::child_of(ContextRole::Worker, &parent).unwrap();
        insert_range(&child, 0..1);

        assert_eq!(numbers(&child), vec![0, 10, 11]);
    }

    #[test]
    fn test_fetch_rejects_bad_ranges() {
        let (coordinator, _dir) = test_coordinator();
        let context = Context::attached(ContextRole::Main, &coordinator, StoreView::Live).unwrap();
        let zero = context.perform_and_wait(|s| s.fetch(0, 0)).unwrap();
        assert_eq!(zero, Err(FetchError::InvalidRange { start: 0, batch_size: 0 }));
        let overflow = context.perform_and_wait(|s| s.fetch(i32::MAX, 2)).unwrap();
        assert!(overflow.is_err());
        // Empty result is not an error
        assert_eq!(context.perform_and_wait(|s| s.fetch(0, 10)).unwrap(), Ok(vec![]));
    }

    #[test]
    fn test_runs_on_own_lane() {
        let (coordinator, _dir) = test_coordinator();
        let context = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        let lane = context.lane_name().to_string();
        let seen = context
            .perform_and_wait(|_| std::thread::current().name().map(String::from))
            .unwrap();
        assert_eq!(seen, Some(lane));
    }
}
