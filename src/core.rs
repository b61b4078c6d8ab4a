use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::io::ChainTrace;

pub trait MarkovChain {
    /// Does one iteration of the chain, returning the new current state and
    /// the outputs recorded for it.
    fn step(&mut self) -> Result<(&[f64], &[f64])>;

    /// Get the current state without stepping.
    fn current_state(&self) -> &[f64];
}

/// Outcome of [`run_chain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRun {
    Completed,
    Cancelled,
}

/// Runs `chain` for `draws` iterations, recording every state into `trace`.
///
/// `cancel` is polled before each iteration; a cancelled run stops early and
/// leaves the trace unfinished so the caller can drop it.
pub fn run_chain<M, T>(
    chain: &mut M,
    draws: usize,
    trace: &mut T,
    cancel: &AtomicBool,
) -> Result<ChainRun>
where
    M: MarkovChain + ?Sized,
    T: ChainTrace + ?Sized,
{
    for _ in 0..draws {
        if cancel.load(Ordering::Relaxed) {
            return Ok(ChainRun::Cancelled);
        }
        let (point, outputs) = chain.step()?;
        trace.record(point, outputs)?;
    }
    Ok(ChainRun::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryChainTrace, TraceLayout};
    use crate::space::{ParameterSpace, VarSpec};

    /// Deterministic counter chain: the state increases by one every step.
    struct Counter {
        state: Vec<f64>,
        outputs: Vec<f64>,
    }

    impl MarkovChain for Counter {
        fn step(&mut self) -> Result<(&[f64], &[f64])> {
            self.state[0] += 1.0;
            self.outputs[0] = -self.state[0];
            Ok((self.state.as_slice(), self.outputs.as_slice()))
        }

        fn current_state(&self) -> &[f64] {
            &self.state
        }
    }

    fn layout() -> TraceLayout {
        TraceLayout::new(
            ParameterSpace::new(vec![VarSpec::continuous("x", &[])]).unwrap(),
            ParameterSpace::new(vec![VarSpec::continuous("like", &[])]).unwrap(),
        )
    }

    #[test]
    fn test_run_chain_records_every_draw() {
        let mut chain = Counter {
            state: vec![0.0],
            outputs: vec![0.0],
        };
        let mut trace = MemoryChainTrace::new(layout());
        trace.setup(5, 0).unwrap();
        let run = run_chain(&mut chain, 5, &mut trace, &AtomicBool::new(false)).unwrap();
        assert_eq!(run, ChainRun::Completed);
        let samples = trace.close().unwrap();
        assert_eq!(samples.draws.nrows(), 5);
        assert_eq!(samples.draws[[4, 0]], 5.0);
        assert_eq!(samples.draws[[4, 1]], -5.0);
    }

    #[test]
    fn test_run_chain_cancelled() {
        let mut chain = Counter {
            state: vec![0.0],
            outputs: vec![0.0],
        };
        let mut trace = MemoryChainTrace::new(layout());
        trace.setup(5, 0).unwrap();
        let run = run_chain(&mut chain, 5, &mut trace, &AtomicBool::new(true)).unwrap();
        assert_eq!(run, ChainRun::Cancelled);
        assert_eq!(chain.current_state(), &[0.0]);
    }
}
