//! Per-stage diagnostics: acceptance rates, importance-weight effective
//! sample size, weighted moments and the potential scale reduction factor.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{AtmipError, Result};
use crate::io::MultiTrace;
use crate::stepper::ChainSummary;
use crate::tempering::{weighted_covariance, weighted_mean};

/// What happened during one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: usize,
    /// Exponent the stage was sampled at.
    pub beta: f64,
    /// Fraction of accepted proposals over all chains.
    pub acceptance_rate: f64,
    /// Effective sample size of the importance weights computed after the
    /// stage.
    pub effective_sample_size: f64,
    /// Largest potential scale reduction factor over all dimensions, if the
    /// stage was long enough to estimate it.
    pub max_rhat: Option<f64>,
}

/// Pooled acceptance rate of a set of chains.
pub fn acceptance_rate(chains: &[ChainSummary]) -> f64 {
    let (accepted, steps) = chains
        .iter()
        .fold((0, 0), |(a, s), c| (a + c.accepted, s + c.steps));
    if steps == 0 {
        0.0
    } else {
        accepted as f64 / steps as f64
    }
}

/// Kish's effective sample size `1 / Σ w²` of normalized weights.
pub fn effective_sample_size(weights: ArrayView1<f64>) -> f64 {
    let sum_sq = weights.dot(&weights);
    if sum_sq > 0.0 {
        1.0 / sum_sq
    } else {
        0.0
    }
}

/// Importance-weighted mean and (unbiased) marginal variances of a population.
pub fn weighted_moments(
    population: ArrayView2<f64>,
    weights: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let mean = weighted_mean(population, weights);
    let var = weighted_covariance(population, weights).diag().to_owned();
    (mean, var)
}

/**
Potential scale reduction factor of every sampled dimension in `trace`.

Uses the between-chain and within-chain variances of the recorded draws.
Needs at least two chains with two draws each. Dimensions with zero
within-chain variance yield `NaN`.
*/
pub fn rhat(trace: &MultiTrace) -> Result<Array1<f64>> {
    let n_chains = trace.n_chains();
    let n = trace.len();
    if n_chains < 2 || n < 2 {
        return Err(AtmipError::Numerical(format!(
            "R-hat needs two chains with two draws, got {n_chains} chains with {n} draws"
        )));
    }
    let d = trace.layout().params.dimensions();
    let mut means = Array2::<f64>::zeros((n_chains, d));
    let mut sm2 = Array2::<f64>::zeros((n_chains, d));
    for c in 0..n_chains {
        let draws = trace
            .chain(c)
            .map(|s| s.draws.slice(s![..n, ..d]).to_owned())
            .ok_or_else(|| AtmipError::Numerical(format!("chain {c} missing from trace")))?;
        let mean = draws
            .mean_axis(Axis(0))
            .ok_or_else(|| AtmipError::Numerical("empty chain".into()))?;
        sm2.row_mut(c).assign(&draws.var_axis(Axis(0), 1.0));
        means.row_mut(c).assign(&mean);
    }

    let nf = n as f64;
    let mean_chain = means
        .mean_axis(Axis(0))
        .ok_or_else(|| AtmipError::Numerical("mean across chains failed".into()))?;
    let between = (&means - &mean_chain.insert_axis(Axis(0)))
        .pow2()
        .sum_axis(Axis(0))
        * (nf / (n_chains as f64 - 1.0));
    let within = sm2
        .mean_axis(Axis(0))
        .ok_or_else(|| AtmipError::Numerical("mean of within-chain variances failed".into()))?;
    let var = &within * ((nf - 1.0) / nf) + &between * (1.0 / nf);
    Ok((var / within).sqrt())
}

/// Largest finite entry of `values`.
pub fn max_finite(values: ArrayView1<f64>) -> Option<f64> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ChainSamples, TraceLayout};
    use crate::space::{ParameterSpace, VarSpec};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_effective_sample_size() {
        let uniform = Array1::from_elem(50, 0.02);
        assert_abs_diff_eq!(effective_sample_size(uniform.view()), 50.0, epsilon = 1e-9);
        let single = arr1(&[0.0, 1.0, 0.0]);
        assert_abs_diff_eq!(effective_sample_size(single.view()), 1.0);
    }

    #[test]
    fn test_acceptance_rate() {
        let chains = [
            ChainSummary {
                chain: 0,
                accepted: 3,
                steps: 10,
                final_scaling: 1.0,
            },
            ChainSummary {
                chain: 1,
                accepted: 7,
                steps: 10,
                final_scaling: 1.0,
            },
        ];
        assert_abs_diff_eq!(acceptance_rate(&chains), 0.5);
        assert_eq!(acceptance_rate(&[]), 0.0);
    }

    #[test]
    fn test_weighted_moments() {
        let pop = arr2(&[[0.0], [2.0], [4.0], [6.0]]);
        let w = Array1::from_elem(4, 0.25);
        let (mean, var) = weighted_moments(pop.view(), w.view());
        assert_abs_diff_eq!(mean[0], 3.0, epsilon = 1e-12);
        // Matches the unbiased sample variance for uniform weights.
        assert_abs_diff_eq!(var[0], 20.0 / 3.0, epsilon = 1e-12);
    }

    fn trace_of(chains: &[Vec<f64>]) -> MultiTrace {
        let layout = TraceLayout::new(
            ParameterSpace::new(vec![VarSpec::continuous("x", &[])]).unwrap(),
            ParameterSpace::new(vec![VarSpec::continuous("like", &[])]).unwrap(),
        );
        let samples = chains
            .iter()
            .enumerate()
            .map(|(i, xs)| ChainSamples {
                chain: i,
                draws: Array2::from_shape_fn((xs.len(), 2), |(r, c)| {
                    if c == 0 {
                        xs[r]
                    } else {
                        0.0
                    }
                }),
            })
            .collect();
        MultiTrace::new(layout, samples).unwrap()
    }

    #[test]
    fn test_rhat_identical_chains_near_one() {
        let xs = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let r = rhat(&trace_of(&[xs.clone(), xs])).unwrap();
        // Identical chain means: no between-chain variance.
        assert_abs_diff_eq!(r[0], (5.0_f64 / 6.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_rhat_separated_chains_large() {
        let r = rhat(&trace_of(&[
            vec![0.0, 0.1, -0.1, 0.05],
            vec![10.0, 10.1, 9.9, 10.05],
        ]))
        .unwrap();
        assert!(r[0] > 10.0);
        assert!(rhat(&trace_of(&[vec![1.0, 2.0]])).is_err());
    }

    #[test]
    fn test_max_finite() {
        assert_eq!(max_finite(arr1(&[1.0, f64::NAN, 3.0]).view()), Some(3.0));
        assert_eq!(max_finite(arr1(&[f64::NAN]).view()), None);
    }
}
