//! Context topologies: how the read-side and write-side contexts relate to
//! coordinators and to each other.
//!
//! | Kind                           | Coordinators | Worker                   | Visibility                    |
//! |--------------------------------|--------------|--------------------------|-------------------------------|
//! | `simple`                       | 1            | the main context         | same object                   |
//! | `shared-coordinator`           | 1            | fresh per call           | next fetch, timing dependent  |
//! | `shared-coordinator-merging`   | 1            | fresh per call           | auto merge of every commit    |
//! | `nested`                       | 1 via top    | fresh child of main      | structural                    |
//! | `nested-propagating`           | 1 via top    | fresh child of main      | structural, saved up to store |
//! | `independent-contexts`         | 1            | one reused, isolated     | none                          |
//! | `independent-contexts-merging` | 1            | one reused, isolated     | peer notification merge       |
//! | `independent-stores`           | 2 files      | one reused, isolated     | none                          |

mod independent;
mod nested;
mod shared;
mod simple;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::StackConfig;
use crate::context::{Context, Scope};
use crate::coordinator::Coordinator;
use crate::error::{LaneError, SaveResult, StoreOpenError};
use crate::save::{save_level, SaveOutcome};

pub use independent::Independent;
pub use nested::Nested;
pub use shared::SharedCoordinator;
pub use simple::Simple;

/// Callback receiving a worker context, or None when none could be made.
pub type WorkerCallback = Box<dyn FnOnce(Option<Context>) + Send + 'static>;

/// A context topology. Fixed for the lifetime of a run.
pub trait Topology: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> TopologyKind;

    /// The read-side context. Always the same context.
    fn main_context(&self) -> Context;

    /// A write-side context. Fresh or reused depending on the variant.
    fn worker_context(&self) -> Result<Context, LaneError>;

    /// Save a context obtained from this topology. Must be called on that
    /// context's lane, which is what holding a `Scope` guarantees.
    fn save(&self, scope: &mut Scope<'_>) -> SaveResult<SaveOutcome> {
        save_level(scope)
    }

    /// Hand a worker context to `callback`, possibly after a lane hop.
    fn with_worker_context(&self, callback: WorkerCallback) {
        match self.worker_context() {
            Ok(context) => callback(Some(context)),
            Err(err) => {
                warn!(topology = %self.kind(), %err, "no worker context");
                callback(None);
            }
        }
    }

    /// Every coordinator this topology opened.
    fn coordinators(&self) -> Vec<Arc<Coordinator>>;
}

/// The available topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    /// Worker is the main context
    Simple,
    /// Independent live contexts on one coordinator
    SharedCoordinator,
    /// As above, every context auto-merges other contexts' commits
    SharedCoordinatorMerging,
    /// Coordinator -> private top -> main -> worker
    Nested,
    /// Nested, with every save propagated up to the store
    NestedPropagating,
    /// Two isolated contexts on one coordinator, no merge
    IndependentContexts,
    /// Two isolated contexts on one coordinator, merging each other's saves
    IndependentContextsMerging,
    /// Two isolated contexts on two store files
    IndependentStores,
}

impl TopologyKind {
    /// Every kind, in table order.
    pub const ALL: [TopologyKind; 8] = [
        TopologyKind::Simple,
        TopologyKind::SharedCoordinator,
        TopologyKind::SharedCoordinatorMerging,
        TopologyKind::Nested,
        TopologyKind::NestedPropagating,
        TopologyKind::IndependentContexts,
        TopologyKind::IndependentContextsMerging,
        TopologyKind::IndependentStores,
    ];

    /// Kebab-case name used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            TopologyKind::Simple => "simple",
            TopologyKind::SharedCoordinator => "shared-coordinator",
            TopologyKind::SharedCoordinatorMerging => "shared-coordinator-merging",
            TopologyKind::Nested => "nested",
            TopologyKind::NestedPropagating => "nested-propagating",
            TopologyKind::IndependentContexts => "independent-contexts",
            TopologyKind::IndependentContextsMerging => "independent-contexts-merging",
            TopologyKind::IndependentStores => "independent-stores",
        }
    }

    /// Whether worker saves ever become visible through the main context.
    pub fn expects_visibility(&self) -> bool {
        !matches!(self, TopologyKind::IndependentContexts | TopologyKind::IndependentStores)
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unknown topology name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown topology '{0}'")]
pub struct ParseTopologyError(pub String);

impl FromStr for TopologyKind {
    type Err = ParseTopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopologyKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseTopologyError(s.to_string()))
    }
}

/// Open the stores `kind` needs and assemble its contexts.
pub fn build(kind: TopologyKind, config: &StackConfig) -> Result<Arc<dyn Topology>, StoreOpenError> {
    if config.reset_store {
        reset_store_files(config)?;
    }
    let open = |path: PathBuf| Coordinator::open(&config.schema, path, config);

    let topology: Arc<dyn Topology> = match kind {
        TopologyKind::Simple => Arc::new(Simple::new(open(config.store_path())?)?),
        TopologyKind::SharedCoordinator => Arc::new(SharedCoordinator::new(open(config.store_path())?, false)?),
        TopologyKind::SharedCoordinatorMerging => {
            Arc::new(SharedCoordinator::new(open(config.store_path())?, true)?)
        }
        TopologyKind::Nested => Arc::new(Nested::new(open(config.store_path())?, false)?),
        TopologyKind::NestedPropagating => Arc::new(Nested::new(open(config.store_path())?, true)?),
        TopologyKind::IndependentContexts => Arc::new(Independent::shared(open(config.store_path())?, false)?),
        TopologyKind::IndependentContextsMerging => {
            Arc::new(Independent::shared(open(config.store_path())?, true)?)
        }
        TopologyKind::IndependentStores => Arc::new(Independent::separate(
            open(config.store_path())?,
            open(config.worker_store_path())?,
        )?),
    };

    info!(topology = %kind, store = %config.store_path().display(), "topology ready");
    Ok(topology)
}

fn reset_store_files(config: &StackConfig) -> Result<(), StoreOpenError> {
    for base in [config.store_path(), config.worker_store_path()] {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = base.clone().into_os_string();
            name.push(suffix);
            let path = PathBuf::from(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StoreOpenError::Attach {
                        path,
                        cause: format!("cannot reset store: {}", e),
                    })
                }
            }
        }
    }
    Ok(())
}
