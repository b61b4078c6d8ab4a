/*!
# ATMIP Stage Orchestrator

Drives the tempering schedule of the Adaptive Transitional Metropolis
Importance sampler (cascading-free ATMIP, Ching & Chen 2007; Minson et al.
2013).

Each stage runs `n_chains` independent Metropolis chains at a fixed tempering
exponent `beta`, collects their end-points, picks the next exponent by
bisection on the coefficient of variation of the importance weights,
rebuilds the proposal from the weighted ensemble covariance and resamples the
chain start points. Once the next exponent would exceed 1, one final pass at
`beta = 1` samples the posterior.

## Example Usage

```rust
use atmip::distributions::{Prior, Uniform};
use atmip::model::ForwardModel;
use atmip::sampler::{Atmip, SamplerConfig};
use atmip::space::{ParameterSpace, VarSpec};
use rand::RngCore;

/// Gaussian likelihood centered at 1 with a flat prior on [-5, 5].
struct Gauss {
    space: ParameterSpace,
    outputs: ParameterSpace,
    prior: Uniform,
}

impl ForwardModel for Gauss {
    fn space(&self) -> &ParameterSpace {
        &self.space
    }
    fn outputs(&self) -> &ParameterSpace {
        &self.outputs
    }
    fn log_bound(&self, q: &[f64]) -> f64 {
        self.prior.log_prob(q[0])
    }
    fn evaluate(&self, q: &[f64]) -> Vec<f64> {
        vec![-0.5 * (q[0] - 1.0).powi(2) / 0.25]
    }
    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        vec![self.prior.sample(rng)]
    }
}

let model = Gauss {
    space: ParameterSpace::new(vec![VarSpec::continuous("x", &[])])?,
    outputs: ParameterSpace::new(vec![VarSpec::continuous("like", &[])])?,
    prior: Uniform::new(-5.0, 5.0)?,
};
let config = SamplerConfig {
    n_chains: 40,
    n_steps: 10,
    ..Default::default()
}
.set_seed(42);

let result = Atmip::new(model, config)?.sample(None)?;
assert_eq!(result.state.beta, 1.0);
let x = result.trace.get_values("x", result.trace.len() - 1)?;
assert_eq!(x.nrows(), 40);
# Ok::<(), atmip::AtmipError>(())
```
*/

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{StageCheckpoint, StageStore};
use crate::core::{run_chain, ChainRun};
use crate::distributions::MvNormalProposal;
use crate::error::{AtmipError, Result};
use crate::io::{ChainSamples, ChainTrace, MemoryBackend, MultiTrace, TraceBackend, TraceLayout};
use crate::model::{likelihood_index, ForwardModel};
use crate::observer::StageObserver;
use crate::resample::resample;
use crate::space::Point;
use crate::state::{EnsembleState, StageEndpoints};
use crate::stats::{acceptance_rate, effective_sample_size, max_finite, rhat, StageSummary};
use crate::stepper::{ChainStepper, ChainSummary, StepConfig, StepPhase};
use crate::tempering::{calc_beta, importance_weights, weighted_covariance};

/// Run parameters of [`Atmip`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of chains, equal to the population size.
    pub n_chains: usize,
    /// Draws per chain and stage after stage 0.
    pub n_steps: usize,
    /// Target coefficient of variation of the importance weights.
    pub coef_variation: f64,
    /// Adapt the proposal scaling from the acceptance rate.
    pub tune: bool,
    /// Steps between two scaling updates.
    pub tune_interval: usize,
    /// Size of the worker pool.
    pub workers: usize,
    /// Seed of all random streams; drawn from entropy if `None`.
    pub seed: Option<u64>,
    /// Stage to resume at. Requires `output_dir`.
    pub resume_stage: Option<usize>,
    /// Reject candidates outside the prior bounds before evaluating the model.
    pub check_bound: bool,
    /// Name of the model output holding the log-likelihood.
    pub likelihood_name: String,
    /// Initial multiplier on proposal draws.
    pub scaling: f64,
    /// Show a progress bar over the chains of every stage.
    pub progress: bool,
    /// Root of the stage directories. No checkpoints are written if `None`.
    pub output_dir: Option<PathBuf>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_chains: 100,
            n_steps: 100,
            coef_variation: 1.0,
            tune: true,
            tune_interval: 100,
            workers: 1,
            seed: None,
            resume_stage: None,
            check_bound: true,
            likelihood_name: "like".to_string(),
            scaling: 1.0,
            progress: false,
            output_dir: None,
        }
    }
}

impl SamplerConfig {
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn set_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn set_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn set_resume_stage(mut self, stage: usize) -> Self {
        self.resume_stage = Some(stage);
        self
    }

    /// Checks every precondition that does not depend on the model.
    pub fn validate(&self) -> Result<()> {
        if self.n_chains == 0 {
            return Err(AtmipError::Configuration(
                "n_chains must be at least 1".into(),
            ));
        }
        if self.n_steps == 0 {
            return Err(AtmipError::Configuration(
                "n_steps must be at least 1".into(),
            ));
        }
        if self.tune_interval == 0 {
            return Err(AtmipError::Configuration(
                "tune_interval must be at least 1".into(),
            ));
        }
        if !(self.coef_variation.is_finite() && self.coef_variation > 0.0) {
            return Err(AtmipError::Configuration(format!(
                "coef_variation must be positive and finite, got {}",
                self.coef_variation
            )));
        }
        if !(self.scaling.is_finite() && self.scaling > 0.0) {
            return Err(AtmipError::Configuration(format!(
                "scaling must be positive and finite, got {}",
                self.scaling
            )));
        }
        partition_chains(self.n_chains, self.workers)?;
        if matches!(self.resume_stage, Some(s) if s > 0) && self.output_dir.is_none() {
            return Err(AtmipError::Configuration(
                "resuming a run requires an output directory".into(),
            ));
        }
        Ok(())
    }
}

/**
Splits `0..n_chains` into `workers` contiguous batches of equal size.

# Examples

```rust
use atmip::sampler::partition_chains;

assert_eq!(partition_chains(12, 4)?, vec![0..3, 3..6, 6..9, 9..12]);
assert!(partition_chains(12, 5).is_err());
# Ok::<(), atmip::AtmipError>(())
```
*/
pub fn partition_chains(n_chains: usize, workers: usize) -> Result<Vec<Range<usize>>> {
    if workers == 0 {
        return Err(AtmipError::Configuration(
            "workers must be at least 1".into(),
        ));
    }
    if workers > 1 && n_chains % workers != 0 {
        return Err(AtmipError::Configuration(format!(
            "n_chains ({n_chains}) must be divisible by the number of workers ({workers})"
        )));
    }
    let size = n_chains / workers;
    Ok((0..workers).map(|w| w * size..(w + 1) * size).collect())
}

/// RNG of random stream `stream` in stage `stage`.
///
/// Streams `0..n_chains` belong to the chains, stream `n_chains` to the
/// resampler.
pub fn stream_rng(seed: u64, stage: usize, n_chains: usize, stream: usize) -> SmallRng {
    let offset = (stage as u64)
        .wrapping_mul(n_chains as u64 + 1)
        .wrapping_add(stream as u64);
    SmallRng::seed_from_u64(seed.wrapping_add(offset))
}

/// Output of [`Atmip::sample`].
#[derive(Debug, Clone)]
pub struct SamplingResult {
    /// Trace of the final pass at `beta = 1`.
    pub trace: MultiTrace,
    /// Ensemble state after the final pass.
    pub state: EnsembleState,
    /// One entry per stage sampled by this call, final pass included.
    pub stages: Vec<StageSummary>,
}

/// One stage worth of chains, shared read-only by all workers.
struct StageJob<'a, M: ?Sized, B> {
    model: &'a M,
    backend: &'a B,
    layout: &'a TraceLayout,
    state: &'a EnsembleState,
    step: &'a StepConfig,
    stage_rng: usize,
    draws: usize,
    stage_path: Option<&'a Path>,
    cancel: &'a AtomicBool,
    progress: Option<&'a ProgressBar>,
}

struct StageRun {
    trace: MultiTrace,
    chains: Vec<ChainSummary>,
}

impl<M: ForwardModel + ?Sized, B: TraceBackend> StageJob<'_, M, B> {
    fn run_one(&self, chain: usize) -> Result<Option<(ChainSamples, ChainSummary)>> {
        let n_chains = self.state.n_chains();
        let rng = stream_rng(self.state.seed, self.stage_rng, n_chains, chain);
        let mut stepper = ChainStepper::new(
            self.model,
            self.step,
            chain,
            self.state.start_point(chain),
            self.state.previous_outputs(chain).to_vec(),
            rng,
        )?;
        let mut trace = self.backend.new_chain(self.stage_path, self.layout)?;
        trace.setup(self.draws, chain)?;
        let outcome = match run_chain(&mut stepper, self.draws, &mut trace, self.cancel)? {
            ChainRun::Completed => Some((trace.close()?, stepper.summary())),
            ChainRun::Cancelled => None,
        };
        if let Some(pb) = self.progress {
            pb.inc(1);
        }
        Ok(outcome)
    }

    fn run_batch(&self, chains: Range<usize>) -> Result<Vec<Option<(ChainSamples, ChainSummary)>>> {
        chains.map(|chain| self.run_one(chain)).collect()
    }
}

/**
The ATMIP sampler.

Owns the forward model, the trace backend, the run configuration and an
optional [`StageObserver`].
*/
pub struct Atmip<M, B = MemoryBackend> {
    model: M,
    backend: B,
    config: SamplerConfig,
    observer: Option<Box<dyn StageObserver>>,
    cancel: Arc<AtomicBool>,
    likelihood_index: usize,
}

impl<M: ForwardModel> Atmip<M, MemoryBackend> {
    /// Creates a sampler that keeps traces in memory.
    ///
    /// Fails with [`AtmipError::Configuration`] if `config` is invalid or the
    /// model outputs do not contain `config.likelihood_name`.
    pub fn new(model: M, config: SamplerConfig) -> Result<Self> {
        Self::with_backend(model, MemoryBackend, config)
    }
}

impl<M: ForwardModel, B: TraceBackend> Atmip<M, B> {
    pub fn with_backend(model: M, backend: B, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        let likelihood_index = likelihood_index(&model, &config.likelihood_name)?;
        Ok(Self {
            model,
            backend,
            config,
            observer: None,
            cancel: Arc::new(AtomicBool::new(false)),
            likelihood_index,
        })
    }

    pub fn with_observer(mut self, observer: impl StageObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Flag that aborts the running stage once set. [`Atmip::sample`] clears
    /// it on return, so the sampler can be run again after a cancellation.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /**
    Runs the tempering schedule until `beta = 1` and then samples the
    posterior once more.

    # Arguments

    * `start` - Optional starting population of `n_chains` points. The
      population is drawn from the model's prior if `None`. Ignored when
      resuming.

    # Returns

    The trace of the final pass, the final ensemble state and a summary of
    every stage sampled by this call.
    */
    pub fn sample(&mut self, start: Option<Vec<Point>>) -> Result<SamplingResult> {
        let result = self.run(start);
        self.cancel.store(false, Ordering::Relaxed);
        result
    }

    fn run(&mut self, start: Option<Vec<Point>>) -> Result<SamplingResult> {
        let store = self.config.output_dir.as_ref().map(StageStore::new);
        let mut state = self.initial_state(store.as_ref(), start)?;
        let mut proposal = MvNormalProposal::new(&state.covariance).unwrap_or_else(|e| {
            warn!("Stored covariance unusable ({e}), starting from the identity.");
            MvNormalProposal::identity(state.dimensions())
        });
        let mut stages = Vec::new();

        while state.beta < 1.0 {
            let stage = state.stage;
            let (phase, draws) = if stage == 0 {
                (StepPhase::Initial, 1)
            } else {
                (StepPhase::Metropolis, self.config.n_steps)
            };
            let stage_dir = store.as_ref().map(|s| s.stage_dir(stage));
            info!("Sampling stage {stage} at beta {:.6}", state.beta);
            let run = self.run_stage(
                &state,
                &proposal,
                phase,
                stage,
                draws,
                stage_dir.as_deref(),
            )?;

            let (population, outputs) = run.trace.endpoints()?;
            let likelihoods = self.likelihoods_of(&outputs);
            let update = calc_beta(state.beta, likelihoods.view(), self.config.coef_variation)?;
            state = state.with_endpoints(StageEndpoints {
                population,
                likelihoods,
                outputs,
            })?;
            self.notify(&state, stage, &run.trace)?;

            let summary = stage_summary(stage, &state, &run, update.weights.view());
            info!(
                "Stage {stage} done: acceptance {:.3}, next beta {:.6}",
                summary.acceptance_rate, update.beta
            );
            stages.push(summary);

            if update.beta > 1.0 {
                debug!("Beta {:.6} exceeds 1, clamping.", update.beta);
                state = EnsembleState {
                    beta: 1.0,
                    old_beta: update.old_beta,
                    ..state
                };
                break;
            }

            let covariance = weighted_covariance(state.population.view(), update.weights.view());
            let (covariance, next_proposal) = checked_proposal(covariance, &proposal, stage);
            proposal = next_proposal;
            let mut rng = stream_rng(state.seed, stage, state.n_chains(), state.n_chains());
            let indexes = resample(update.weights.view(), &mut rng);
            state = state.advance(update.beta, update.old_beta, update.weights, covariance, indexes)?;

            if let Some(store) = &store {
                self.persist(store, &store.stage_dir(stage), &state);
            }
            state = state.at_stage(stage + 1);
        }

        self.final_pass(store.as_ref(), state, proposal, stages)
    }

    fn final_pass(
        &mut self,
        store: Option<&StageStore>,
        state: EnsembleState,
        proposal: MvNormalProposal,
        mut stages: Vec<StageSummary>,
    ) -> Result<SamplingResult> {
        let stage = state.stage + 1;
        info!("Sampling the posterior at beta 1 (stage {stage})");

        let weights = importance_weights(1.0 - state.old_beta, state.likelihoods.view())?;
        let covariance = weighted_covariance(state.population.view(), weights.view());
        let (covariance, proposal) = checked_proposal(covariance, &proposal, stage);
        let mut rng = stream_rng(state.seed, stage, state.n_chains(), state.n_chains());
        let indexes = resample(weights.view(), &mut rng);
        let state = state.advance(1.0, state.old_beta, weights, covariance, indexes)?;

        let final_dir = store.map(StageStore::final_dir);
        let run = self.run_stage(
            &state,
            &proposal,
            StepPhase::Metropolis,
            stage,
            self.config.n_steps,
            final_dir.as_deref(),
        )?;
        let (population, outputs) = run.trace.endpoints()?;
        let likelihoods = self.likelihoods_of(&outputs);
        let state = state.with_endpoints(StageEndpoints {
            population,
            likelihoods,
            outputs,
        })?;

        let summary = stage_summary(stage, &state, &run, state.weights.view());
        info!(
            "Final stage done: acceptance {:.3}",
            summary.acceptance_rate
        );
        stages.push(summary);

        if let (Some(store), Some(dir)) = (store, final_dir) {
            self.persist(store, &dir, &state);
        }

        Ok(SamplingResult {
            trace: run.trace,
            state,
            stages,
        })
    }

    fn initial_state(
        &mut self,
        store: Option<&StageStore>,
        start: Option<Vec<Point>>,
    ) -> Result<EnsembleState> {
        let n_chains = self.config.n_chains;
        let space = self.model.space();

        if let Some(resume_stage) = self.config.resume_stage.filter(|&s| s > 0) {
            let store = store.ok_or_else(|| {
                AtmipError::Configuration("resuming a run requires an output directory".into())
            })?;
            let checkpoint = store.resume(resume_stage)?;
            let state = checkpoint.state;
            if state.n_chains() != n_chains {
                return Err(AtmipError::Configuration(format!(
                    "checkpoint holds {} chains, configuration asks for {n_chains}",
                    state.n_chains()
                )));
            }
            space.check_len(state.dimensions(), "checkpoint population")?;
            if let (Some(observer), Some(update)) = (self.observer.as_mut(), checkpoint.update) {
                observer.restore(update)?;
            }
            if self.config.seed.is_some_and(|s| s != state.seed) {
                debug!("Ignoring configured seed, resuming with the stored seed {}.", state.seed);
            }
            info!(
                "Resuming at stage {resume_stage} from beta {:.6}",
                state.beta
            );
            return Ok(state);
        }

        let seed = self.config.seed.unwrap_or_else(rand::random);
        let population = match start {
            Some(points) => {
                if points.len() != n_chains {
                    return Err(AtmipError::Configuration(format!(
                        "start population has {} points, n_chains is {n_chains}",
                        points.len()
                    )));
                }
                let mut population = Array2::zeros((n_chains, space.dimensions()));
                for (mut row, point) in population.rows_mut().into_iter().zip(&points) {
                    row.assign(&Array1::from(space.flatten(point)?));
                }
                population
            }
            None => {
                let mut population = Array2::zeros((n_chains, space.dimensions()));
                for (chain, mut row) in population.rows_mut().into_iter().enumerate() {
                    let mut rng = stream_rng(seed, 0, n_chains, chain);
                    let draw = self.model.sample_prior(&mut rng);
                    space.check_len(draw.len(), "prior draw")?;
                    row.assign(&Array1::from(draw));
                }
                population
            }
        };
        debug!("Initial population of {n_chains} chains, seed {seed}");
        Ok(EnsembleState::initial(population, self.config.scaling, seed))
    }

    fn run_stage(
        &self,
        state: &EnsembleState,
        proposal: &MvNormalProposal,
        phase: StepPhase,
        stage: usize,
        draws: usize,
        stage_path: Option<&Path>,
    ) -> Result<StageRun> {
        let config = &self.config;
        let n_chains = state.n_chains();
        let step = StepConfig {
            phase,
            beta: state.beta,
            scaling: state.scaling,
            proposal: proposal.clone(),
            n_steps: config.n_steps,
            tune: config.tune,
            tune_interval: config.tune_interval,
            check_bound: config.check_bound,
            dim_kinds: self.model.space().dim_kinds(),
            likelihood_index: self.likelihood_index,
        };
        let layout = TraceLayout::new(self.model.space().clone(), self.model.outputs().clone());

        let pb = config.progress.then(|| {
            let pb = ProgressBar::new(n_chains as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:8} {bar:40.white} {pos}/{len} ETA {eta:3}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
            pb.set_prefix(format!("Stage {stage}"));
            pb
        });

        let job = StageJob {
            model: &self.model,
            backend: &self.backend,
            layout: &layout,
            state,
            step: &step,
            stage_rng: stage,
            draws,
            stage_path,
            cancel: self.cancel.as_ref(),
            progress: pb.as_ref(),
        };

        let batches = partition_chains(n_chains, config.workers)?;
        let results: Vec<Result<Vec<_>>> = if config.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.workers)
                .build()
                .map_err(|e| {
                    AtmipError::Configuration(format!("failed to create worker pool: {e}"))
                })?;
            pool.install(|| {
                batches
                    .into_par_iter()
                    .map(|batch| job.run_batch(batch))
                    .collect()
            })
        } else {
            batches.into_iter().map(|batch| job.run_batch(batch)).collect()
        };
        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }

        let mut samples = Vec::with_capacity(n_chains);
        let mut chains = Vec::with_capacity(n_chains);
        for batch in results {
            for outcome in batch? {
                let (s, c) = outcome.ok_or(AtmipError::Cancelled { stage })?;
                samples.push(s);
                chains.push(c);
            }
        }
        Ok(StageRun {
            trace: MultiTrace::new(layout, samples)?,
            chains,
        })
    }

    fn likelihoods_of(&self, outputs: &[Vec<f64>]) -> Array1<f64> {
        outputs.iter().map(|o| o[self.likelihood_index]).collect()
    }

    fn notify(&mut self, state: &EnsembleState, stage: usize, trace: &MultiTrace) -> Result<()> {
        if let Some(observer) = self.observer.as_mut() {
            let mean = state.mean_point(self.model.space())?;
            observer.on_stage_complete(&mean);
            if stage == 0 {
                observer.on_initial_stage_complete(trace);
            }
        }
        Ok(())
    }

    /// Writes the checkpoint of `state` into `dir`. Failures only cost
    /// resumability and are logged.
    fn persist(&self, store: &StageStore, dir: &Path, state: &EnsembleState) {
        let checkpoint = StageCheckpoint {
            state: state.clone(),
            update: self.observer.as_ref().and_then(|o| o.snapshot()),
        };
        match store.save_to(dir, &checkpoint) {
            Ok(path) => debug!("Saved stage {} to {}", state.stage, path.display()),
            Err(e) => warn!(
                "Could not save stage {}, the run is not resumable from it: {e}",
                state.stage
            ),
        }
    }
}

/// Proposal for `covariance`, or the previous proposal if the covariance is
/// unusable.
fn checked_proposal(
    covariance: Array2<f64>,
    previous: &MvNormalProposal,
    stage: usize,
) -> (Array2<f64>, MvNormalProposal) {
    match MvNormalProposal::new(&covariance) {
        Ok(proposal) => (covariance, proposal),
        Err(e) => {
            warn!("Stage {stage}: {e}. Keeping the previous proposal.");
            (previous.covariance().clone(), previous.clone())
        }
    }
}

fn stage_summary(
    stage: usize,
    state: &EnsembleState,
    run: &StageRun,
    weights: ndarray::ArrayView1<f64>,
) -> StageSummary {
    let max_rhat = rhat(&run.trace)
        .ok()
        .and_then(|r| max_finite(r.view()));
    StageSummary {
        stage,
        beta: state.beta,
        acceptance_rate: acceptance_rate(&run.chains),
        effective_sample_size: effective_sample_size(weights),
        max_rhat,
    }
}
