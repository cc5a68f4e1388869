//! Coordinator -> private top -> main -> worker.
//!
//! Only the private top context touches the coordinator. A worker save
//! becomes the main context's pending changes; a main save becomes the
//! top's pending changes. Without propagation nothing reaches the store
//! until someone saves the upper levels; with propagation every successful
//! save schedules a save of its parent on the parent's lane.

use std::sync::Arc;

use crate::context::{Context, ContextRole, Scope, StoreView};
use crate::coordinator::Coordinator;
use crate::error::{LaneError, SaveResult};
use crate::save::{save_level, save_propagating, SaveOutcome};

use super::{Topology, TopologyKind};

/// Three-level parent/child chain over one coordinator.
pub struct Nested {
    coordinator: Arc<Coordinator>,
    top: Context,
    main: Context,
    propagating: bool,
}

impl Nested {
    /// Build the private top and main contexts.
    pub fn new(coordinator: Arc<Coordinator>, propagating: bool) -> Result<Self, LaneError> {
        let top = Context::attached(ContextRole::PrivateTop, &coordinator, StoreView::Live)?;
        let main = Context::child_of(ContextRole::Main, &top)?;
        Ok(Self {
            coordinator,
            top,
            main,
            propagating,
        })
    }

    /// The private top-level context, the main context's parent.
    pub fn private_context(&self) -> &Context {
        &self.top
    }
}

impl Topology for Nested {
    fn kind(&self) -> TopologyKind {
        if self.propagating {
            TopologyKind::NestedPropagating
        } else {
            TopologyKind::Nested
        }
    }

    fn main_context(&self) -> Context {
        self.main.clone()
    }

    fn worker_context(&self) -> Result<Context, LaneError> {
        Context::child_of(ContextRole::Worker, &self.main)
    }

    fn save(&self, scope: &mut Scope<'_>) -> SaveResult<SaveOutcome> {
        if self.propagating {
            save_propagating(scope)
        } else {
            save_level(scope)
        }
    }

    fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        vec![Arc::clone(&self.coordinator)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::schema::SchemaSource;
    use tempfile::TempDir;

    #[test]
    fn test_chain_shape() {
        let dir = TempDir::new().unwrap();
        let config = StackConfig::quick(dir.path());
        let coordinator = Coordinator::open(&SchemaSource::Builtin, config.store_path(), &config).unwrap();
        let topology = Nested::new(coordinator, false).unwrap();

        let main = topology.main_context();
        let worker = topology.worker_context().unwrap();
        assert!(worker.parent().unwrap().same_as(&main));
        assert!(main.parent().unwrap().same_as(topology.private_context()));
        assert!(topology.private_context().coordinator().is_some());
        assert!(main.coordinator().is_none());
    }
}
