/*!
# Chain Stepper

One annealed Metropolis chain for one stage.

A [`ChainStepper`] is built for every chain slot at the start of a stage from
an immutable [`StepConfig`] snapshot, the slot's starting point, the outputs
of its lineage's previous accepted end-point, and a chain-specific RNG.
Scaling, tuning counters and the proposal batch are local to the chain, so
chains never share mutable state.

The stepper has two phases:

- [`StepPhase::Initial`] (stage 0): the forward model is evaluated at the prior
  draw and the draw is accepted as is.
- [`StepPhase::Metropolis`] (later stages): proposals `q = q0 + scaling * delta`
  with `delta` from the stage's [`MvNormalProposal`], accepted with
  probability `min(1, exp(beta * (L(q) - L(prev))))`.
*/

use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::core::MarkovChain;
use crate::distributions::MvNormalProposal;
use crate::error::{AtmipError, Result};
use crate::model::{evaluate_checked, ForwardModel};
use crate::space::VarKind;
use crate::tempering::tune;

/// Behavior of [`ChainStepper::astep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Evaluate and accept the prior draw.
    Initial,
    /// Full annealed Metropolis transition.
    Metropolis,
}

/// Read-only step configuration shared by all chains of a stage.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub phase: StepPhase,
    /// Tempering exponent of the stage.
    pub beta: f64,
    /// Initial multiplier on proposal draws.
    pub scaling: f64,
    pub proposal: MvNormalProposal,
    /// Length of a chain-run; a new proposal batch is drawn every `n_steps`.
    pub n_steps: usize,
    pub tune: bool,
    pub tune_interval: usize,
    /// Evaluate the bound log-density before the forward model.
    pub check_bound: bool,
    /// Kind of every flat dimension.
    pub dim_kinds: Vec<VarKind>,
    /// Position of the log-likelihood in the model outputs.
    pub likelihood_index: usize,
}

impl StepConfig {
    fn any_discrete(&self) -> bool {
        self.dim_kinds.iter().any(|k| *k == VarKind::Discrete)
    }

    fn all_discrete(&self) -> bool {
        !self.dim_kinds.is_empty() && self.dim_kinds.iter().all(|k| *k == VarKind::Discrete)
    }
}

/// Acceptance statistics of one finished chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainSummary {
    pub chain: usize,
    pub accepted: usize,
    pub steps: usize,
    pub final_scaling: f64,
}

impl ChainSummary {
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.accepted as f64 / self.steps as f64
        }
    }
}

/// A Markov chain driven by [`ChainStepper::astep`].
pub struct ChainStepper<'a, M: ?Sized> {
    model: &'a M,
    config: &'a StepConfig,
    chain: usize,
    rng: SmallRng,
    current: Vec<f64>,
    previous: Vec<f64>,
    batch: Array2<f64>,
    scaling: f64,
    accepted: usize,
    steps_until_tune: usize,
    stage_sample: usize,
    total_accepted: usize,
    total_steps: usize,
}

impl<'a, M: ForwardModel + ?Sized> ChainStepper<'a, M> {
    /**
    Creates the stepper for chain slot `chain`.

    # Arguments

    * `start` - Flat starting point of the chain.
    * `previous` - Outputs at the lineage's previous accepted point; ignored in
      the initial phase.
    * `rng` - Chain-specific random number generator.
    */
    pub fn new(
        model: &'a M,
        config: &'a StepConfig,
        chain: usize,
        start: Vec<f64>,
        previous: Vec<f64>,
        rng: SmallRng,
    ) -> Result<Self> {
        model.space().check_len(start.len(), "chain start point")?;
        if config.dim_kinds.len() != start.len() {
            return Err(AtmipError::DimensionMismatch {
                context: "step configuration".into(),
                expected: start.len(),
                found: config.dim_kinds.len(),
            });
        }
        if config.phase == StepPhase::Metropolis {
            model
                .outputs()
                .check_len(previous.len(), "lineage previous outputs")?;
        }
        let d = start.len();
        Ok(Self {
            model,
            config,
            chain,
            rng,
            current: start,
            previous,
            batch: Array2::zeros((0, d)),
            scaling: config.scaling,
            accepted: 0,
            steps_until_tune: config.tune_interval,
            stage_sample: 0,
            total_accepted: 0,
            total_steps: 0,
        })
    }

    /// Outputs at the lineage's previous accepted point.
    pub fn previous_outputs(&self) -> &[f64] {
        &self.previous
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            chain: self.chain,
            accepted: self.total_accepted,
            steps: self.total_steps,
            final_scaling: self.scaling,
        }
    }

    /**
    Performs one transition from `q0` and returns the new point together with
    the outputs to record for it.

    On rejection the returned outputs are the lineage's previous end-point
    outputs, so every iteration produces a full trace row. Candidates with a
    non-finite bound density or likelihood are rejected silently.
    */
    pub fn astep(&mut self, q0: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        self.total_steps += 1;
        match self.config.phase {
            StepPhase::Initial => {
                let out = evaluate_checked(self.model, q0)?;
                self.previous = out.clone();
                self.total_accepted += 1;
                Ok((q0.to_vec(), out))
            }
            StepPhase::Metropolis => self.metropolis_step(q0),
        }
    }

    fn metropolis_step(&mut self, q0: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        let config = self.config;

        if self.stage_sample == 0 {
            self.batch = config.proposal.sample(config.n_steps, &mut self.rng);
        }

        if config.tune && self.steps_until_tune == 0 {
            self.scaling = tune(self.accepted as f64 / config.tune_interval as f64);
            self.steps_until_tune = config.tune_interval;
            self.accepted = 0;
        }

        let mut delta: Vec<f64> = self
            .batch
            .row(self.stage_sample)
            .iter()
            .map(|x| x * self.scaling)
            .collect();

        let (q0, q): (Vec<f64>, Vec<f64>) = if config.all_discrete() {
            let q0: Vec<f64> = q0.iter().map(|x| x.round()).collect();
            let q = q0
                .iter()
                .zip(delta.iter())
                .map(|(x, dx)| x + dx.round())
                .collect();
            (q0, q)
        } else if config.any_discrete() {
            for (dx, kind) in delta.iter_mut().zip(config.dim_kinds.iter()) {
                if *kind == VarKind::Discrete {
                    *dx = dx.round();
                }
            }
            let q = q0
                .iter()
                .zip(delta.iter())
                .zip(config.dim_kinds.iter())
                .map(|((x, dx), kind)| match kind {
                    VarKind::Discrete => (x + dx).round(),
                    VarKind::Continuous => x + dx,
                })
                .collect();
            (q0.to_vec(), q)
        } else {
            let q = q0.iter().zip(delta.iter()).map(|(x, dx)| x + dx).collect();
            (q0.to_vec(), q)
        };

        let candidate = if config.check_bound && !self.model.log_bound(&q).is_finite() {
            None
        } else {
            Some(evaluate_checked(self.model, &q)?)
        };

        let idx = config.likelihood_index;
        let accepted = match &candidate {
            Some(out) if out[idx].is_finite() => {
                let log_ratio = config.beta * (out[idx] - self.previous[idx]);
                metrop_accept(log_ratio, &mut self.rng)
            }
            _ => false,
        };

        let result = match candidate {
            Some(out) if accepted => {
                self.accepted += 1;
                self.total_accepted += 1;
                self.previous = out.clone();
                (q, out)
            }
            _ => (q0, self.previous.clone()),
        };

        self.steps_until_tune = self.steps_until_tune.saturating_sub(1);
        self.stage_sample += 1;
        if self.stage_sample == config.n_steps {
            self.stage_sample = 0;
        }

        Ok(result)
    }
}

/// Metropolis selection in log space. A NaN ratio never accepts.
fn metrop_accept<R: Rng + ?Sized>(log_ratio: f64, rng: &mut R) -> bool {
    if log_ratio.is_nan() {
        return false;
    }
    let u: f64 = rng.gen();
    u.ln() < log_ratio
}

impl<M: ForwardModel + ?Sized> MarkovChain for ChainStepper<'_, M> {
    fn step(&mut self) -> Result<(&[f64], &[f64])> {
        let current = std::mem::take(&mut self.current);
        let (q_new, _) = self.astep(&current)?;
        self.current = q_new;
        Ok((self.current.as_slice(), self.previous.as_slice()))
    }

    fn current_state(&self) -> &[f64] {
        &self.current
    }
}
