//! Linear inversion with ATMIP: recovers the two parameters of a straight line
//! from noisy observations and prints the stage schedule and posterior moments.

use atmip::distributions::{Prior, Uniform};
use atmip::model::ForwardModel;
use atmip::sampler::{Atmip, SamplerConfig};
use atmip::space::{ParameterSpace, VarSpec};
use atmip::stats::weighted_moments;

use ndarray::Array1;
use rand::{thread_rng, Rng, RngCore};
use rand_distr::Normal;
use std::error::Error;

/// y_i = slope * t_i + offset, observed with Gaussian noise of known sigma.
struct Line {
    space: ParameterSpace,
    outputs: ParameterSpace,
    prior: Uniform,
    t: Array1<f64>,
    y: Array1<f64>,
    sigma: f64,
}

impl ForwardModel for Line {
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
        let pred = &self.t * q[0] + q[1];
        let residuals = &self.y - &pred;
        let like = -0.5 * residuals.dot(&residuals) / (self.sigma * self.sigma);
        let mut out = vec![like];
        out.extend(pred.iter());
        out
    }

    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        vec![self.prior.sample(rng), self.prior.sample(rng)]
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    const N_OBS: usize = 20;
    const SIGMA: f64 = 0.3;
    let mut rng = thread_rng();

    let t = Array1::linspace(0.0, 1.0, N_OBS);
    let noise = Normal::new(0.0, SIGMA)?;
    let y = t.mapv(|ti| 2.0 * ti - 1.0 + rng.sample(noise));

    let model = Line {
        space: ParameterSpace::new(vec![
            VarSpec::continuous("slope", &[]),
            VarSpec::continuous("offset", &[]),
        ])?,
        outputs: ParameterSpace::new(vec![
            VarSpec::continuous("like", &[]),
            VarSpec::continuous("prediction", &[N_OBS]),
        ])?,
        prior: Uniform::new(-10.0, 10.0)?,
        t,
        y,
        sigma: SIGMA,
    };

    let output_dir = std::env::temp_dir().join("atmip_gauss_demo");
    let config = SamplerConfig {
        n_chains: 400,
        n_steps: 50,
        tune_interval: 10,
        workers: 4,
        progress: true,
        ..Default::default()
    }
    .set_seed(rng.gen())
    .set_output_dir(&output_dir);

    let result = Atmip::new(model, config)?.sample(None)?;

    for s in &result.stages {
        println!(
            "stage {:>3}  beta {:.6}  acceptance {:.3}  ESS {:>7.1}",
            s.stage, s.beta, s.acceptance_rate, s.effective_sample_size
        );
    }

    let (mean, var) = weighted_moments(result.state.population.view(), result.state.weights.view());
    println!(
        "slope  {:.3} +- {:.3}\noffset {:.3} +- {:.3}",
        mean[0],
        var[0].sqrt(),
        mean[1],
        var[1].sqrt()
    );
    println!("Checkpoints written to {}", output_dir.display());
    Ok(())
}
