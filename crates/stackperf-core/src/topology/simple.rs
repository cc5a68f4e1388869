//! One context does everything.

use std::sync::Arc;

use crate::context::{Context, ContextRole, StoreView};
use crate::coordinator::Coordinator;
use crate::error::LaneError;

use super::{Topology, TopologyKind};

/// The main context doubles as the worker: reads and writes share one lane,
/// so a population blocks every fetch until it finishes.
pub struct Simple {
    coordinator: Arc<Coordinator>,
    main: Context,
}

impl Simple {
    /// Attach the single context to `coordinator`.
    pub fn new(coordinator: Arc<Coordinator>) -> Result<Self, LaneError> {
        let main = Context::attached(ContextRole::Main, &coordinator, StoreView::Live)?;
        Ok(Self { coordinator, main })
    }
}

impl Topology for Simple {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Simple
    }

    fn main_context(&self) -> Context {
        self.main.clone()
    }

    fn worker_context(&self) -> Result<Context, LaneError> {
        Ok(self.main.clone())
    }

    fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        vec![Arc::clone(&self.coordinator)]
    }
}
