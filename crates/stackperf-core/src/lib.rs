//! StackPerf Core: context topologies over a shared record store
//!
//! Benchmarks ways of arranging a read-side context and a write-side context
//! against one or more store coordinators, and of making the writer's saves
//! visible to the reader.
//!
//! # Architecture
//!
//! - **Lanes**: every context lives on one serial thread; its state is only
//!   reachable from closures run there
//! - **Coordinator**: RAM-mirrored SQLite store, single writer, concurrent
//!   readers, save notifications in commit order
//! - **Topologies**: eight arrangements of main/worker contexts, from one
//!   shared context to two contexts on separate store files
//! - **Workload**: bulk populate on a worker, paginated fetch on the main
//!   context

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod lane;
pub mod record;
pub mod save;
pub mod schema;
pub mod topology;
pub mod workload;

// Re-export key types for convenience
pub use config::{SavePolicy, StackConfig};
pub use context::{Context, ContextId, ContextRole, ContextStats, Scope, StoreView};
pub use coordinator::{ChangeSet, CommitReceipt, Coordinator, SaveNotification, SourceFilter};
pub use error::{ConfigError, FetchError, LaneError, SaveError, SaveResult, StoreOpenError};
pub use fetch::{fetch_iterative, FetchTermination, Page, PageCursor};
pub use lane::Lane;
pub use record::Record;
pub use save::{ancestor_failures, await_propagation, save_level, save_propagating, SaveOutcome};
pub use schema::{load_schema, Schema, SchemaSource};
pub use topology::{build, Topology, TopologyKind};
pub use workload::{Completion, FetchReport, PopulateReport, PopulateThenFetch, Workload};
