//! Configuration for a benchmark run.
//!
//! Two presets: `benchmark` reproduces the reference workload (one save per
//! inserted record, one record per fetched page, bounded paging), `quick`
//! batches saves and pages until empty for fast test runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::fetch::{FetchTermination, REFERENCE_FETCH_LIMIT};
use crate::schema::SchemaSource;

/// Default main store file name.
pub const STORE_FILE: &str = "SessionsDB.sqlite";

/// Default second store file, used only by the independent-stores topology.
pub const WORKER_STORE_FILE: &str = "SessionsDB-worker.sqlite";

/// When the populate workload saves its worker context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// Save after every inserted record
    PerRecord,
    /// Save after every `every` records, and once at the end
    Batched {
        /// Records per save
        every: u32,
    },
}

impl SavePolicy {
    /// Whether to save after the `inserted`-th record of a run.
    pub fn should_save(&self, inserted: u64) -> bool {
        match self {
            SavePolicy::PerRecord => true,
            SavePolicy::Batched { every } => *every > 0 && inserted % u64::from(*every) == 0,
        }
    }
}

/// Configuration shared by topology construction and workload drivers.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Directory holding the store files
    pub store_dir: PathBuf,
    /// Main store file name
    pub store_file: String,
    /// Second store file name (independent-stores topology only)
    pub worker_store_file: String,
    /// Schema applied when a store is attached
    pub schema: SchemaSource,
    /// Numbers covered by one fetched page
    pub fetch_batch_size: i32,
    /// When fetch paging stops
    pub fetch_termination: FetchTermination,
    /// When populate saves
    pub save_policy: SavePolicy,
    /// Extra attempts for commits that hit a busy/locked store
    pub commit_retries: u32,
    /// Backoff unit between commit attempts (multiplied by the attempt)
    pub retry_backoff: Duration,
    /// Delete existing store files before the topology opens them
    pub reset_store: bool,
}

impl StackConfig {
    /// Reference workload: per-record saves, single-record pages, bounded paging.
    pub fn benchmark<P: AsRef<Path>>(store_dir: P) -> Self {
        Self {
            store_dir: store_dir.as_ref().to_path_buf(),
            store_file: STORE_FILE.into(),
            worker_store_file: WORKER_STORE_FILE.into(),
            schema: SchemaSource::Builtin,
            fetch_batch_size: 1,
            fetch_termination: FetchTermination::Bounded { limit: REFERENCE_FETCH_LIMIT },
            save_policy: SavePolicy::PerRecord,
            commit_retries: 3,
            retry_backoff: Duration::from_millis(5),
            reset_store: false,
        }
    }

    /// Fast preset for tests: batched saves, larger pages, page until empty.
    pub fn quick<P: AsRef<Path>>(store_dir: P) -> Self {
        Self {
            fetch_batch_size: 100,
            fetch_termination: FetchTermination::UntilEmpty,
            save_policy: SavePolicy::Batched { every: 100 },
            ..Self::benchmark(store_dir)
        }
    }

    /// Path of the main store file.
    pub fn store_path(&self) -> PathBuf {
        self.store_dir.join(&self.store_file)
    }

    /// Path of the second store file.
    pub fn worker_store_path(&self) -> PathBuf {
        self.store_dir.join(&self.worker_store_file)
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_file.is_empty() || self.worker_store_file.is_empty() {
            return Err(ConfigError("store file names must not be empty".into()));
        }
        if self.store_file == self.worker_store_file {
            return Err(ConfigError("worker store file must differ from the main store file".into()));
        }
        if self.fetch_batch_size <= 0 {
            return Err(ConfigError("fetch_batch_size must be > 0".into()));
        }
        if let SavePolicy::Batched { every: 0 } = self.save_policy {
            return Err(ConfigError("batched save interval must be > 0".into()));
        }
        if self.commit_retries > 100 {
            return Err(ConfigError("commit_retries must be <= 100".into()));
        }
        Ok(())
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::benchmark("stackperf-data")
    }
}
