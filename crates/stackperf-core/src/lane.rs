//! Lanes: serial execution queues backed by one named thread each.
//!
//! Every context is bound to exactly one lane for its whole life. Work
//! submitted to a lane runs strictly in submission order; work on different
//! lanes is unordered.
//!
//! The lane thread owns the receiving end of an unbounded channel. Dropping
//! the last `Lane` handle closes the channel; the thread drains whatever was
//! already queued and exits.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{trace, warn};

use crate::error::LaneError;

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_LANE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Id of the lane running on this thread, 0 for threads that are not lanes
    static CURRENT_LANE: Cell<u64> = const { Cell::new(0) };
}

/// Handle to a serial execution lane. Cheap to clone.
#[derive(Clone)]
pub struct Lane {
    inner: Arc<LaneInner>,
}

struct LaneInner {
    id: u64,
    name: String,
    /// Job queue; taken on drop to close the channel
    sender: Option<Sender<Job>>,
    /// Lane thread join handle
    thread: Option<thread::JoinHandle<()>>,
}

impl Lane {
    /// Start a new lane thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self, LaneError> {
        let name = name.into();
        let id = NEXT_LANE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded::<Job>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CURRENT_LANE.with(|current| current.set(id));
                for job in receiver.iter() {
                    job();
                }
            })
            .map_err(|e| LaneError::Spawn {
                lane: name.clone(),
                message: e.to_string(),
            })?;

        trace!(lane = %name, "lane started");
        Ok(Self {
            inner: Arc::new(LaneInner {
                id,
                name,
                sender: Some(sender),
                thread: Some(thread),
            }),
        })
    }

    /// Lane name, also used as the thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True when called from this lane's own thread.
    pub fn is_current(&self) -> bool {
        CURRENT_LANE.with(|current| current.get() == self.inner.id)
    }

    /// Number of jobs queued and not yet started.
    pub fn queued(&self) -> usize {
        self.inner.sender.as_ref().map_or(0, |s| s.len())
    }

    /// Queue `job` and return immediately.
    pub fn perform<F>(&self, job: F) -> Result<(), LaneError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.inner.sender.as_ref().ok_or_else(|| self.closed())?;
        sender.send(Box::new(job)).map_err(|_| self.closed())
    }

    /// Queue `job` and block until it has run, returning its result.
    ///
    /// Calling this from the lane itself would wait on a job queued behind
    /// the caller, so it fails with `LaneError::Reentrant` instead.
    pub fn perform_and_wait<F, R>(&self, job: F) -> Result<R, LaneError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(LaneError::Reentrant { lane: self.inner.name.clone() });
        }
        let (done_tx, done_rx) = bounded(1);
        self.perform(move || {
            let _ = done_tx.send(job());
        })?;
        // A panicking job drops done_tx without sending
        done_rx.recv().map_err(|_| self.closed())
    }

    fn closed(&self) -> LaneError {
        LaneError::Closed { lane: self.inner.name.clone() }
    }
}

impl fmt::Debug for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("name", &self.inner.name)
            .field("queued", &self.queued())
            .finish()
    }
}

impl Drop for LaneInner {
    fn drop(&mut self) {
        // Closing the channel lets the thread finish the queue and exit
        self.sender.take();
        if let Some(handle) = self.thread.take() {
            // The last handle can be released by a job on the lane itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(lane = %self.name, "lane thread panicked");
            }
        }
    }
}
