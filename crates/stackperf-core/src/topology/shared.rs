//! Independent live contexts sharing one coordinator.
//!
//! Every worker is a fresh background context attached straight to the
//! coordinator. Without merging, the main context only notices a worker's
//! commit when its next fetch happens to run after that commit. With
//! merging, every context is subscribed to all commits made by the others,
//! like a container that merges changes into its contexts automatically.

use std::sync::Arc;

use tracing::debug;

use crate::context::{Context, ContextRole, StoreView};
use crate::coordinator::{Coordinator, SourceFilter};
use crate::error::LaneError;

use super::{Topology, TopologyKind};

/// Main and workers attached directly to one coordinator.
pub struct SharedCoordinator {
    coordinator: Arc<Coordinator>,
    main: Context,
    merging: bool,
}

impl SharedCoordinator {
    /// Build the main context; workers are created on demand.
    pub fn new(coordinator: Arc<Coordinator>, merging: bool) -> Result<Self, LaneError> {
        let main = Context::attached(ContextRole::Main, &coordinator, StoreView::Live)?;
        if merging {
            main.subscribe_to(&coordinator, SourceFilter::AnyOther);
        }
        Ok(Self { coordinator, main, merging })
    }
}

impl Topology for SharedCoordinator {
    fn kind(&self) -> TopologyKind {
        if self.merging {
            TopologyKind::SharedCoordinatorMerging
        } else {
            TopologyKind::SharedCoordinator
        }
    }

    fn main_context(&self) -> Context {
        self.main.clone()
    }

    fn worker_context(&self) -> Result<Context, LaneError> {
        let worker = Context::attached(ContextRole::Worker, &self.coordinator, StoreView::Live)?;
        if self.merging {
            worker.subscribe_to(&self.coordinator, SourceFilter::AnyOther);
        }
        debug!(worker = %worker.id(), merging = self.merging, "background context");
        Ok(worker)
    }

    fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        vec![Arc::clone(&self.coordinator)]
    }
}
