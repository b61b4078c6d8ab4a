//! Mixed discrete/continuous inversion: the number of pulses `n` in a signal
//! and their common amplitude.

use atmip::distributions::{DiscreteUniform, Prior, Uniform};
use atmip::model::ForwardModel;
use atmip::sampler::{Atmip, SamplerConfig};
use atmip::space::{ParameterSpace, VarSpec};
use rand::RngCore;
use std::error::Error;

/// Total energy `n * amplitude^2` observed as 18 with noise 1, plus a weak
/// constraint `amplitude ~ 1.5 +- 0.5` from a second measurement.
struct Pulses {
    space: ParameterSpace,
    outputs: ParameterSpace,
    count: DiscreteUniform,
    amplitude: Uniform,
}

impl ForwardModel for Pulses {
    fn space(&self) -> &ParameterSpace {
        &self.space
    }

    fn outputs(&self) -> &ParameterSpace {
        &self.outputs
    }

    fn log_bound(&self, q: &[f64]) -> f64 {
        self.count.log_prob(q[0]) + self.amplitude.log_prob(q[1])
    }

    fn evaluate(&self, q: &[f64]) -> Vec<f64> {
        let energy = q[0] * q[1] * q[1];
        let like = -0.5 * (energy - 18.0).powi(2) - 0.5 * ((q[1] - 1.5) / 0.5).powi(2);
        vec![like, energy]
    }

    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        vec![self.count.sample(rng), self.amplitude.sample(rng)]
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let model = Pulses {
        space: ParameterSpace::new(vec![
            VarSpec::discrete("n", &[]),
            VarSpec::continuous("amplitude", &[]),
        ])?,
        outputs: ParameterSpace::new(vec![
            VarSpec::continuous("like", &[]),
            VarSpec::continuous("energy", &[]),
        ])?,
        count: DiscreteUniform::new(1, 20)?,
        amplitude: Uniform::new(0.0, 5.0)?,
    };

    let config = SamplerConfig {
        n_chains: 200,
        n_steps: 40,
        tune_interval: 10,
        ..Default::default()
    }
    .set_seed(42);
    let result = Atmip::new(model, config)?.sample(None)?;
    println!("Sampled {} stages.", result.stages.len());

    let n = result.trace.get_values("n", 0)?;
    let mut counts = [0usize; 21];
    for k in n.iter() {
        counts[*k as usize] += 1;
    }
    let total = n.len() as f64;
    println!("Posterior of the pulse count:");
    for (k, &c) in counts.iter().enumerate().skip(1) {
        if c > 0 {
            println!("n={k:2}: {:.3}", c as f64 / total);
        }
    }

    let energy = result.trace.get_values("energy", 0)?;
    println!("Mean energy: {:.2}", energy.mean().unwrap_or(f64::NAN));
    Ok(())
}
