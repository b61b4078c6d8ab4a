//! Checkpointing and resuming of ATMIP runs.
//!
//! A run resumed from the stage checkpoints of an earlier run with the same
//! seed has to retrace that run exactly.

use std::fs;
use std::path::Path;

use atmip::checkpoint::{StageStore, PARAMS_FILE};
use atmip::distributions::{Prior, Uniform};
use atmip::model::ForwardModel;
use atmip::sampler::{Atmip, SamplerConfig};
use atmip::space::{ParameterSpace, VarSpec};
use rand::RngCore;
use tempfile::tempdir;

/// Narrow 2-D Gaussian likelihood under a wide flat prior: many stages.
struct Sharp {
    space: ParameterSpace,
    outputs: ParameterSpace,
    prior: Uniform,
}

impl Sharp {
    fn new() -> Self {
        Self {
            space: ParameterSpace::new(vec![VarSpec::continuous("x", &[2])]).unwrap(),
            outputs: ParameterSpace::new(vec![VarSpec::continuous("like", &[])]).unwrap(),
            prior: Uniform::new(-10.0, 10.0).unwrap(),
        }
    }
}

impl ForwardModel for Sharp {
    fn space(&self) -> &ParameterSpace {
        &self.space
    }

    fn outputs(&self) -> &ParameterSpace {
        &self.outputs
    }

    fn log_bound(&self, q: &[f64]) -> f64 {
        q.iter().map(|x| self.prior.log_prob(*x)).sum()
    }

    fn evaluate(&self, q: &[f64]) -> Vec<f64> {
        let ss: f64 = q.iter().map(|x| (x - 0.5).powi(2)).sum();
        vec![-0.5 * ss / 0.01_f64.powi(2)]
    }

    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        (0..2).map(|_| self.prior.sample(rng)).collect()
    }
}

fn config(dir: &Path) -> SamplerConfig {
    SamplerConfig {
        n_chains: 40,
        n_steps: 5,
        tune_interval: 2,
        ..Default::default()
    }
    .set_seed(11)
    .set_output_dir(dir)
}

#[test]
fn test_resume_reproduces_uninterrupted_run() {
    let full_dir = tempdir().unwrap();
    let full = Atmip::new(Sharp::new(), config(full_dir.path()))
        .unwrap()
        .sample(None)
        .unwrap();
    assert!(
        full.stages.len() > 6,
        "expected a long schedule, got {} stages",
        full.stages.len()
    );

    let full_store = StageStore::new(full_dir.path());
    assert!(full_store.final_dir().join(PARAMS_FILE).exists());

    // Keep stages 0..=3 and a half-written stage 4.
    let resume_dir = tempdir().unwrap();
    let resume_store = StageStore::new(resume_dir.path());
    for stage in 0..=3 {
        let dst = resume_store.stage_dir(stage);
        fs::create_dir_all(&dst).unwrap();
        fs::copy(
            full_store.stage_dir(stage).join(PARAMS_FILE),
            dst.join(PARAMS_FILE),
        )
        .unwrap();
    }
    fs::create_dir_all(resume_store.stage_dir(4)).unwrap();
    fs::write(resume_store.stage_dir(4).join("leftover"), "x").unwrap();

    let resumed = Atmip::new(
        Sharp::new(),
        config(resume_dir.path()).set_resume_stage(4),
    )
    .unwrap()
    .sample(None)
    .unwrap();

    assert!(!resume_store.stage_dir(4).join("leftover").exists());
    let expected = full_store.load(4).unwrap();
    let got = resume_store.load(4).unwrap();
    assert_eq!(got.state.beta, expected.state.beta);
    assert_eq!(got.state, expected.state);

    assert_eq!(resumed.state, full.state);
    assert_eq!(resumed.stages.first().map(|s| s.stage), Some(4));
    assert_eq!(resumed.stages.last(), full.stages.last());
}

#[test]
fn test_resume_without_checkpoint_fails() {
    let dir = tempdir().unwrap();
    let mut sampler = Atmip::new(Sharp::new(), config(dir.path()).set_resume_stage(2)).unwrap();
    assert!(matches!(
        sampler.sample(None),
        Err(atmip::AtmipError::Storage { .. })
    ));
}

/// Gaussian likelihood that is `-inf` on the left half of the prior.
struct HalfLine {
    space: ParameterSpace,
    outputs: ParameterSpace,
    prior: Uniform,
}

impl ForwardModel for HalfLine {
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
        if q[0] < 0.0 {
            vec![f64::NEG_INFINITY]
        } else {
            vec![-0.5 * (q[0] - 2.0).powi(2) / 0.05_f64.powi(2)]
        }
    }

    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        vec![self.prior.sample(rng)]
    }
}

fn half_line() -> HalfLine {
    HalfLine {
        space: ParameterSpace::new(vec![VarSpec::continuous("x", &[])]).unwrap(),
        outputs: ParameterSpace::new(vec![VarSpec::continuous("like", &[])]).unwrap(),
        prior: Uniform::new(-5.0, 5.0).unwrap(),
    }
}

#[test]
fn test_resume_after_infinite_likelihoods() {
    let dir = tempdir().unwrap();
    let config = SamplerConfig {
        n_chains: 20,
        n_steps: 5,
        tune_interval: 2,
        ..Default::default()
    }
    .set_seed(17)
    .set_output_dir(dir.path());

    let full = Atmip::new(half_line(), config.clone())
        .unwrap()
        .sample(None)
        .unwrap();
    assert!(full.stages.len() > 2);

    let store = StageStore::new(dir.path());
    let stage_0 = store.load(0).unwrap();
    assert!(stage_0
        .state
        .likelihoods
        .iter()
        .any(|l| *l == f64::NEG_INFINITY));

    let resumed = Atmip::new(half_line(), config.set_resume_stage(1))
        .unwrap()
        .sample(None)
        .unwrap();
    assert_eq!(resumed.state, full.state);
}

#[cfg(feature = "csv")]
#[test]
fn test_csv_traces_written_per_stage() {
    use atmip::io::csv::{chain_file_name, CsvBackend};

    let dir = tempdir().unwrap();
    let config = SamplerConfig {
        n_chains: 8,
        n_steps: 4,
        ..Default::default()
    }
    .set_seed(5)
    .set_output_dir(dir.path());
    let result = Atmip::with_backend(Sharp::new(), CsvBackend, config)
        .unwrap()
        .sample(None)
        .unwrap();

    let store = StageStore::new(dir.path());
    for chain in 0..8 {
        assert!(store.stage_dir(0).join(chain_file_name(chain)).exists());
        assert!(store.final_dir().join(chain_file_name(chain)).exists());
    }
    assert_eq!(result.trace.len(), 4);
}
