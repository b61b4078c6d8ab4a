//! End-to-end checks of the ATMIP sampler against analytic posteriors.
//!
//! 1. `test_gaussian_posterior_moments`: a flat prior times a Gaussian
//!    likelihood must give the likelihood's mean and variance.
//! 2. `test_discrete_posterior`: in a purely discrete space every draw stays
//!    integer and the posterior concentrates on the likelihood's mode.

use atmip::distributions::{DiscreteUniform, Prior, Uniform};
use atmip::model::ForwardModel;
use atmip::sampler::{Atmip, SamplerConfig};
use atmip::space::{ParameterSpace, VarSpec};
use rand::RngCore;

/// Flat prior on [-5, 5] times N(y | x, sigma^2).
struct GaussianLikelihood {
    space: ParameterSpace,
    outputs: ParameterSpace,
    prior: Uniform,
    y: f64,
    sigma: f64,
}

impl GaussianLikelihood {
    fn new(y: f64, sigma: f64) -> Self {
        Self {
            space: ParameterSpace::new(vec![VarSpec::continuous("x", &[])]).unwrap(),
            outputs: ParameterSpace::new(vec![
                VarSpec::continuous("like", &[]),
                VarSpec::continuous("residual", &[]),
            ])
            .unwrap(),
            prior: Uniform::new(-5.0, 5.0).unwrap(),
            y,
            sigma,
        }
    }
}

impl ForwardModel for GaussianLikelihood {
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
        let r = q[0] - self.y;
        vec![-0.5 * r * r / (self.sigma * self.sigma), r]
    }

    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        vec![self.prior.sample(rng)]
    }
}

#[test]
fn test_gaussian_posterior_moments() {
    const Y: f64 = 1.0;
    const SIGMA: f64 = 0.5;

    let config = SamplerConfig {
        n_chains: 200,
        n_steps: 25,
        coef_variation: 1.0,
        ..Default::default()
    }
    .set_seed(42);
    let mut sampler = Atmip::new(GaussianLikelihood::new(Y, SIGMA), config).unwrap();
    let result = sampler.sample(None).unwrap();

    assert_eq!(result.state.beta, 1.0);
    assert!(result.stages.len() >= 2);

    let x = result.trace.get_values("x", 0).unwrap();
    assert_eq!(x.dim(), (200 * 25, 1));
    let mean = x.mean().unwrap();
    let var = x.var(1.0);
    assert!((mean - Y).abs() < 0.15, "posterior mean {mean}");
    assert!(
        (var - SIGMA * SIGMA).abs() < 0.1,
        "posterior variance {var}"
    );

    // Recorded outputs belong to the recorded points.
    let residual = result.trace.get_values("residual", 0).unwrap();
    for (xi, ri) in x.iter().zip(residual.iter()) {
        assert!((xi - Y - ri).abs() < 1e-12);
    }
}

/// Integer `k` uniform on [-10, 10] with a Gaussian likelihood around 3.
struct DiscreteModel {
    space: ParameterSpace,
    outputs: ParameterSpace,
    prior: DiscreteUniform,
}

impl ForwardModel for DiscreteModel {
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
        vec![-0.5 * (q[0] - 3.0).powi(2)]
    }

    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        vec![self.prior.sample(rng)]
    }
}

#[test]
fn test_discrete_posterior() {
    let model = DiscreteModel {
        space: ParameterSpace::new(vec![VarSpec::discrete("k", &[])]).unwrap(),
        outputs: ParameterSpace::new(vec![VarSpec::continuous("like", &[])]).unwrap(),
        prior: DiscreteUniform::new(-10, 10).unwrap(),
    };
    let config = SamplerConfig {
        n_chains: 100,
        n_steps: 20,
        ..Default::default()
    }
    .set_seed(3);
    let result = Atmip::new(model, config).unwrap().sample(None).unwrap();

    let k = result.trace.get_values("k", 0).unwrap();
    assert!(k.iter().all(|v| v.fract() == 0.0 && (-10.0..=10.0).contains(v)));
    let mean = k.mean().unwrap();
    assert!((mean - 3.0).abs() < 0.5, "posterior mean {mean}");
}
