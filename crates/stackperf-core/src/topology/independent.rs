//! Two isolated contexts, each attached directly to a coordinator.
//!
//! Both contexts pin a snapshot of the store when created and never re-read
//! it. Without merging they stay blind to each other's saves for good. With
//! merging each context subscribes to the other's saves and folds the delta
//! into its snapshot on its own lane. The separate-stores variant gives
//! each context its own store file, so there is nothing to merge.

use std::sync::Arc;

use crate::context::{Context, ContextRole, StoreView};
use crate::coordinator::{Coordinator, SourceFilter};
use crate::error::LaneError;

use super::{Topology, TopologyKind};

/// Reused main/worker pair with isolated views.
pub struct Independent {
    kind: TopologyKind,
    main_coordinator: Arc<Coordinator>,
    worker_coordinator: Arc<Coordinator>,
    main: Context,
    worker: Context,
}

impl Independent {
    /// Both contexts on one coordinator, optionally merging each other's saves.
    pub fn shared(coordinator: Arc<Coordinator>, merging: bool) -> Result<Self, LaneError> {
        let main = Context::attached(ContextRole::Main, &coordinator, StoreView::Isolated)?;
        let worker = Context::attached(ContextRole::Worker, &coordinator, StoreView::Isolated)?;
        let kind = if merging {
            main.subscribe_to(&coordinator, SourceFilter::Context(worker.id()));
            worker.subscribe_to(&coordinator, SourceFilter::Context(main.id()));
            TopologyKind::IndependentContextsMerging
        } else {
            TopologyKind::IndependentContexts
        };
        Ok(Self {
            kind,
            main_coordinator: Arc::clone(&coordinator),
            worker_coordinator: coordinator,
            main,
            worker,
        })
    }

    /// Each context on its own coordinator and store file.
    pub fn separate(main_coordinator: Arc<Coordinator>, worker_coordinator: Arc<Coordinator>) -> Result<Self, LaneError> {
        let main = Context::attached(ContextRole::Main, &main_coordinator, StoreView::Isolated)?;
        let worker = Context::attached(ContextRole::Worker, &worker_coordinator, StoreView::Isolated)?;
        Ok(Self {
            kind: TopologyKind::IndependentStores,
            main_coordinator,
            worker_coordinator,
            main,
            worker,
        })
    }
}

impl Topology for Independent {
    fn kind(&self) -> TopologyKind {
        self.kind
    }

    fn main_context(&self) -> Context {
        self.main.clone()
    }

    fn worker_context(&self) -> Result<Context, LaneError> {
        Ok(self.worker.clone())
    }

    fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        if Arc::ptr_eq(&self.main_coordinator, &self.worker_coordinator) {
            vec![Arc::clone(&self.main_coordinator)]
        } else {
            vec![Arc::clone(&self.main_coordinator), Arc::clone(&self.worker_coordinator)]
        }
    }
}
