//! Workload drivers: bulk population and paginated fetch.
//!
//! Exactly three entry points, matching the triggers a front end exposes.
//! Each one schedules its work and returns a `Completion` right away; with
//! no topology installed they do nothing and return `None`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info, warn};

use crate::config::StackConfig;
use crate::context::{Context, ContextId};
use crate::error::{FetchError, LaneError, SaveError};
use crate::fetch::PageCursor;
use crate::lane::Lane;
use crate::record::Record;
use crate::save::{ancestor_failures, await_propagation};
use crate::topology::Topology;

/// Records inserted by the reference populate trigger.
pub const REFERENCE_POPULATION: i32 = 10_000;

/// Result of a population run.
#[derive(Debug, Clone)]
pub struct PopulateReport {
    /// Worker context that did the inserts
    pub context: ContextId,
    /// First number inserted
    pub start: i32,
    /// Records asked for
    pub requested: i32,
    /// Records inserted, saved or not
    pub inserted: u64,
    /// Saves that moved changes
    pub saves: u64,
    /// Wall time on the worker lane
    pub elapsed: Duration,
    /// Save failure that stopped the run
    pub error: Option<SaveError>,
    /// Failure of a save propagated to an ancestor context in the
    /// background. Those changes never reached the store.
    pub propagation_error: Option<SaveError>,
}

/// Result of a paginated fetch.
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// Pages fetched, including the final empty one
    pub pages: usize,
    /// Records seen across all pages
    pub records: usize,
    /// Wall time on the driver lane
    pub elapsed: Duration,
    /// Query failure that stopped paging
    pub error: Option<FetchError>,
}

/// Handles for both halves of `populate_then_fetch`.
pub struct PopulateThenFetch {
    /// The population run
    pub populate: Completion<PopulateReport>,
    /// The fetch, submitted without waiting for the population. None when
    /// the driver lane could not take it.
    pub fetch: Option<Completion<FetchReport>>,
}

/// Receives the report of one scheduled run.
pub struct Completion<T> {
    receiver: Receiver<T>,
}

impl<T> Completion<T> {
    fn channel() -> (Sender<T>, Self) {
        let (sender, receiver) = bounded(1);
        (sender, Self { receiver })
    }

    /// Block until the run finishes. `None` if it was never able to run.
    pub fn wait(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    /// Like `wait`, giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// Drives populate and fetch runs against the installed topology.
pub struct Workload {
    topology: Option<Arc<dyn Topology>>,
    config: StackConfig,
    driver: Lane,
    epoch: DateTime<Utc>,
}

impl Workload {
    /// New driver. `topology` may be absent, in which case every entry
    /// point is a no-op.
    pub fn new(topology: Option<Arc<dyn Topology>>, config: StackConfig) -> Result<Self, LaneError> {
        Ok(Self {
            topology,
            config,
            driver: Lane::spawn("workload-driver")?,
            // Stored timestamps keep milliseconds only
            epoch: Utc::now().trunc_subsecs(3),
        })
    }

    /// Installed topology.
    pub fn topology(&self) -> Option<&Arc<dyn Topology>> {
        self.topology.as_ref()
    }

    /// Timestamp record times are derived from.
    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Insert `count` records numbered from `start` on a worker context,
    /// saving per the configured policy.
    pub fn populate(&self, start: i32, count: i32) -> Option<Completion<PopulateReport>> {
        let topology = Arc::clone(self.topology.as_ref()?);
        let policy = self.config.save_policy;
        let epoch = self.epoch;
        let (sender, completion) = Completion::channel();

        let saver = Arc::clone(&topology);
        topology.with_worker_context(Box::new(move |worker: Option<Context>| {
            let Some(worker) = worker else {
                return;
            };
            let id = worker.id();
            let queued = worker.perform(move |scope| {
                let started = Instant::now();
                let failed_before = ancestor_failures(scope.context());
                let mut report = PopulateReport {
                    context: scope.id(),
                    start,
                    requested: count,
                    inserted: 0,
                    saves: 0,
                    elapsed: Duration::ZERO,
                    error: None,
                    propagation_error: None,
                };
                let end = start.saturating_add(count.max(0));
                for number in start..end {
                    scope.insert(Record::synthesize(number, epoch));
                    report.inserted += 1;
                    if !policy.should_save(report.inserted) {
                        continue;
                    }
                    match saver.save(scope) {
                        Ok(outcome) if !outcome.is_clean() => report.saves += 1,
                        Ok(_) => {}
                        Err(err) => {
                            report.error = Some(err);
                            break;
                        }
                    }
                }
                if report.error.is_none() && scope.has_changes() {
                    match saver.save(scope) {
                        Ok(_) => report.saves += 1,
                        Err(err) => report.error = Some(err),
                    }
                }
                report.propagation_error = await_propagation(scope.context(), &failed_before);
                report.elapsed = started.elapsed();

                match (&report.error, &report.propagation_error) {
                    (Some(err), _) => error!(context = %report.context, inserted = report.inserted, %err, "populate stopped"),
                    (None, Some(err)) => error!(context = %report.context, %err, "populate not persisted"),
                    (None, None) => info!(
                        context = %report.context,
                        inserted = report.inserted,
                        saves = report.saves,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "populate finished"
                    ),
                }
                let _ = sender.send(report);
            });
            if let Err(err) = queued {
                warn!(context = %id, %err, "populate not scheduled");
            }
        }));
        Some(completion)
    }

    /// Page through the main context from number 0.
    pub fn fetch(&self) -> Option<Completion<FetchReport>> {
        let main = self.topology.as_ref()?.main_context();
        let batch_size = self.config.fetch_batch_size;
        let termination = self.config.fetch_termination;
        let (sender, completion) = Completion::channel();

        let queued = self.driver.perform(move || {
            let started = Instant::now();
            let mut report = FetchReport {
                pages: 0,
                records: 0,
                elapsed: Duration::ZERO,
                error: None,
            };
            for page in PageCursor::new(main, 0, batch_size, termination) {
                match page {
                    Ok(page) => {
                        report.pages += 1;
                        report.records += page.len();
                    }
                    Err(err) => report.error = Some(err),
                }
            }
            report.elapsed = started.elapsed();

            match &report.error {
                Some(err) => error!(pages = report.pages, %err, "fetch stopped"),
                None => info!(
                    pages = report.pages,
                    records = report.records,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "fetch finished"
                ),
            }
            let _ = sender.send(report);
        });
        if let Err(err) = queued {
            warn!(%err, "fetch not scheduled");
            return None;
        }
        Some(completion)
    }

    /// Populate a second block of records and fetch without waiting for it.
    ///
    /// The population handle is returned even when the fetch could not be
    /// scheduled; the population is already running by then.
    pub fn populate_then_fetch(&self) -> Option<PopulateThenFetch> {
        let populate = self.populate(REFERENCE_POPULATION, REFERENCE_POPULATION)?;
        let fetch = self.fetch();
        Some(PopulateThenFetch { populate, fetch })
    }
}
