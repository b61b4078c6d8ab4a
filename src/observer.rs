//! Hook for callers that refine model state between stages.
//!
//! A typical observer re-estimates auxiliary quantities of the forward model
//! (for example data covariances) from the current population mean. Its state
//! travels with the stage checkpoints through [`StageObserver::snapshot`] and
//! [`StageObserver::restore`].

use crate::error::Result;
use crate::io::MultiTrace;
use crate::space::Point;

pub trait StageObserver: Send {
    /// Called after every completed stage with the mean of the chain
    /// end-points.
    fn on_stage_complete(&mut self, mean: &Point);

    /// Called once after stage 0 with its full trace.
    fn on_initial_stage_complete(&mut self, _trace: &MultiTrace) {}

    /// State to store alongside the stage checkpoint.
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restores the state saved by [`StageObserver::snapshot`] when a run is
    /// resumed.
    fn restore(&mut self, _snapshot: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Observer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn on_stage_complete(&mut self, _mean: &Point) {}
}
