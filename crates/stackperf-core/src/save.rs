//! Save propagation.
//!
//! A one-level save (`Scope::save`) moves a context's pending changes either
//! into its parent or into the store. Propagating saves keep going: after a
//! successful save, the parent is saved on the parent's own lane, and so on
//! up the chain. The caller only waits for the first level.
//!
//! A background ancestor save that fails is recorded on that ancestor
//! (`ContextStats::saves_failed`, `Context::last_save_error`). What happens
//! to its pending set depends on the error:
//!
//! - transient (busy/locked store): the change set is kept, so the next
//!   save of that ancestor commits it along with whatever arrives later;
//! - anything else (constraint violation, I/O, closed lane): the change set
//!   is rolled back. Saves are all-or-nothing, so keeping it would make
//!   every later save of the ancestor fail the same way.
//!
//! `await_propagation` lets a caller wait for the chain to settle and pick
//! up such failures.

use tracing::{error, warn};

use crate::context::{Context, Scope};
use crate::coordinator::CommitReceipt;
use crate::error::{SaveError, SaveResult};

/// What a successful save did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing was pending
    Clean,
    /// Changes became the parent's pending changes
    Pushed {
        /// Records handed to the parent
        records: usize,
    },
    /// Changes were physically committed
    Committed(CommitReceipt),
}

impl SaveOutcome {
    /// True when the save had nothing to do.
    pub fn is_clean(&self) -> bool {
        matches!(self, SaveOutcome::Clean)
    }
}

/// One-level save: into the parent's pending set, or into the store.
/// A no-op when nothing is pending.
pub fn save_level(scope: &mut Scope<'_>) -> SaveResult<SaveOutcome> {
    scope.save()
}

/// Save this level, then schedule a save of every ancestor, each on its own
/// lane. Ancestor failures are recorded on the ancestor and handled as
/// described in the module docs.
pub fn save_propagating(scope: &mut Scope<'_>) -> SaveResult<SaveOutcome> {
    let outcome = save_level(scope)?;
    if outcome.is_clean() {
        return Ok(outcome);
    }
    if let Some(parent) = scope.parent() {
        parent.perform(|ancestor| {
            if let Err(err) = save_propagating(ancestor) {
                if err.is_transient() {
                    warn!(context = %ancestor.id(), %err, "ancestor save failed, keeping changes");
                } else {
                    let dropped = ancestor.rollback();
                    error!(context = %ancestor.id(), %err, dropped, "ancestor save failed, changes rolled back");
                }
            }
        })?;
    }
    Ok(outcome)
}

/// Wait until every propagated save already scheduled above `context` has
/// run, then return the first failure recorded by an ancestor whose
/// `saves_failed` count moved past `failed_before` (one entry per ancestor,
/// nearest first, as taken from `ContextStats` before the saves).
///
/// Must not be called from an ancestor's lane.
pub fn await_propagation(context: &Context, failed_before: &[u64]) -> Option<SaveError> {
    let ancestors = context.ancestors();
    // Each level's save is queued before the level below finishes, so a
    // barrier per level, nearest first, sees the whole chain through
    for ancestor in &ancestors {
        if let Err(err) = ancestor.perform_and_wait(|_| ()) {
            return Some(err.into());
        }
    }
    ancestors
        .iter()
        .zip(failed_before.iter().copied().chain(std::iter::repeat(0)))
        .filter(|(ancestor, before)| ancestor.stats().saves_failed > *before)
        .find_map(|(ancestor, _)| ancestor.last_save_error())
}

/// `saves_failed` of every ancestor of `context`, nearest first.
pub fn ancestor_failures(context: &Context) -> Vec<u64> {
    context.ancestors().iter().map(|a| a.stats().saves_failed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::context::{Context, ContextRole, StoreView};
    use crate::coordinator::Coordinator;
    use crate::record::Record;
    use crate::schema::SchemaSource;
    use chrono::Utc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_propagates_to_store() {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        let top = Context::attached(ContextRole::PrivateTop, &coordinator, StoreView::Live).unwrap();
        let main = Context::child_of(ContextRole::Main, &top).unwrap();
        let worker = Context::child_of(ContextRole::Worker, &main).unwrap();

        let epoch = Utc::now();
        let outcome = worker
            .perform_and_wait(move |scope| {
                scope.insert(Record::synthesize(1, epoch));
                save_propagating(scope)
            })
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Pushed { records: 1 });

        assert!(wait_until(|| coordinator.row_count() == 1));
        assert!(wait_until(|| top.stats().saves_committed == 1));
        assert_eq!(main.stats().saves_committed, 1);
    }

    #[test]
    fn test_failed_ancestor_save_rolls_back() {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        let epoch = Utc::now();
        let seed = Context::attached(ContextRole::Worker, &coordinator, StoreView::Live).unwrap();
        seed.perform_and_wait(move |scope| {
            scope.insert(Record::synthesize(5, epoch));
            scope.save()
        })
        .unwrap()
        .unwrap();

        let top = Context::attached(ContextRole::PrivateTop, &coordinator, StoreView::Live).unwrap();
        let main = Context::child_of(ContextRole::Main, &top).unwrap();
        let worker = Context::child_of(ContextRole::Worker, &main).unwrap();
        let insert_and_propagate = |numbers: Vec<i32>| {
            worker
                .perform_and_wait(move |scope| {
                    for n in numbers {
                        scope.insert(Record::synthesize(n, epoch));
                    }
                    save_propagating(scope)
                })
                .unwrap()
                .unwrap()
        };

        // The duplicate only fails at the top, in the background
        let before = ancestor_failures(&worker);
        assert_eq!(before, vec![0, 0]);
        insert_and_propagate(vec![4, 5]);
        let err = await_propagation(&worker, &before).unwrap();
        assert!(matches!(err, SaveError::Constraint { .. }));
        assert_eq!(top.stats().saves_failed, 1);
        assert_eq!(top.perform_and_wait(|s| s.pending_count()).unwrap(), 0);

        // The chain is not wedged
        let before = ancestor_failures(&worker);
        insert_and_propagate(vec![6]);
        assert_eq!(await_propagation(&worker, &before), None);
        let numbers: Vec<i32> = coordinator.fetch_range(0..=10).iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![5, 6]);
    }

    #[test]
    fn test_clean_save_does_not_propagate() {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        let top = Context::attached(ContextRole::PrivateTop, &coordinator, StoreView::Live).unwrap();
        let child = Context::child_of(ContextRole::Main, &top).unwrap();

        let outcome = child.perform_and_wait(save_propagating).unwrap().unwrap();
        assert!(outcome.is_clean());
        // Queue a barrier behind anything the save might have scheduled
        top.perform_and_wait(|_| ()).unwrap();
        assert_eq!(top.stats().saves_requested, 0);
    }
}
