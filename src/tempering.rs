/*!
# Tempering Controller

Chooses the next tempering exponent `beta` and the importance weights of the
ensemble, following Ching & Chen (2007).

The next exponent is found by bisection on `(beta, 2.0]`: the coefficient of
variation of the weights `exp((beta_new - beta) * (L - max L))` grows with
`beta_new`, so the search moves towards the value where it equals the target
`coef_variation`. A result above 1 means the posterior has been reached and
the caller clamps it.

The module also holds the weighted covariance used to rebuild the proposal and
the acceptance-rate tuning law of Muto & Beck (2008).
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_stats::QuantileExt;

use crate::error::{AtmipError, Result};

/// Upper end of the bisection interval.
pub const BETA_UPPER: f64 = 2.0;

/// Width of the bisection interval at which the search stops.
pub const BETA_TOLERANCE: f64 = 1e-6;

/// Result of one tempering update.
#[derive(Debug, Clone, PartialEq)]
pub struct BetaUpdate {
    /// Exponent for the next stage (may exceed 1).
    pub beta: f64,
    /// Exponent the likelihoods were sampled at.
    pub old_beta: f64,
    /// Normalized importance weights.
    pub weights: Array1<f64>,
}

/**
Computes the next tempering exponent and the importance weights.

# Arguments

* `beta` - Current tempering exponent.
* `likelihoods` - Log-likelihoods of the chain end-points.
* `coef_variation` - Target coefficient of variation of the weights.

# Examples

```rust
use atmip::tempering::calc_beta;
use ndarray::arr1;

let update = calc_beta(0.0, arr1(&[-3.0, -1.0, -0.5, -2.0]).view(), 1.0).unwrap();
assert!(update.beta > 0.0);
assert!((update.weights.sum() - 1.0).abs() < 1e-12);
```
*/
pub fn calc_beta(
    beta: f64,
    likelihoods: ArrayView1<f64>,
    coef_variation: f64,
) -> Result<BetaUpdate> {
    let max_llk = finite_max(likelihoods)?;

    let mut low_beta = beta;
    let mut up_beta = BETA_UPPER;
    let mut current_beta = beta;
    let mut temp = Array1::<f64>::ones(likelihoods.len());

    while up_beta - low_beta > BETA_TOLERANCE {
        current_beta = 0.5 * (low_beta + up_beta);
        temp = increments(current_beta - beta, likelihoods, max_llk);
        let mean = temp.mean().unwrap_or(0.0);
        let cov_temp = if mean != 0.0 && mean.is_finite() {
            temp.std(0.0) / mean
        } else {
            f64::INFINITY
        };
        if cov_temp > coef_variation {
            up_beta = current_beta;
        } else {
            low_beta = current_beta;
        }
    }

    Ok(BetaUpdate {
        beta: current_beta,
        old_beta: beta,
        weights: normalize(temp)?,
    })
}

/// Importance weights for a fixed exponent increment `delta_beta`.
pub fn importance_weights(delta_beta: f64, likelihoods: ArrayView1<f64>) -> Result<Array1<f64>> {
    let max_llk = finite_max(likelihoods)?;
    normalize(increments(delta_beta, likelihoods, max_llk))
}

fn increments(delta_beta: f64, likelihoods: ArrayView1<f64>, max_llk: f64) -> Array1<f64> {
    likelihoods.mapv(|l| {
        if l.is_finite() {
            (delta_beta * (l - max_llk)).exp()
        } else {
            0.0
        }
    })
}

fn finite_max(likelihoods: ArrayView1<f64>) -> Result<f64> {
    let finite = likelihoods
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .collect::<Array1<f64>>();
    finite
        .max()
        .copied()
        .map_err(|_| AtmipError::Numerical("no finite likelihood in the ensemble".into()))
}

fn normalize(temp: Array1<f64>) -> Result<Array1<f64>> {
    let total = temp.sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(AtmipError::Numerical(format!(
            "importance weights sum to {total}"
        )));
    }
    Ok(temp / total)
}

/**
Importance-weighted covariance of the ensemble.

Rows of `population` are observations. With normalized weights `w` this is

\[
C = \frac{\sum_i w_i (x_i - \mu)(x_i - \mu)^T}{1 - \sum_i w_i^2}, \qquad \mu = \sum_i w_i x_i
\]

i.e. the unbiased reliability-weighted estimate. When a single chain carries
all the weight the denominator vanishes and the result contains non-finite
entries, which the proposal constructor rejects.
*/
pub fn weighted_covariance(population: ArrayView2<f64>, weights: ArrayView1<f64>) -> Array2<f64> {
    let w = &weights / weights.sum();
    let mean = population.t().dot(&w);
    let centered = &population - &mean.view().insert_axis(Axis(0));
    let weighted = &centered * &w.view().insert_axis(Axis(1));
    let fact = 1.0 - w.dot(&w);
    weighted.t().dot(&centered) / fact
}

/// Weighted mean of the ensemble rows.
pub fn weighted_mean(population: ArrayView2<f64>, weights: ArrayView1<f64>) -> Array1<f64> {
    population.t().dot(&weights) / weights.sum()
}

/// Proposal scaling for an observed acceptance rate (Muto & Beck 2008).
pub fn tune(acc_rate: f64) -> f64 {
    let a = 1.0 / 9.0;
    let b = 8.0 / 9.0;
    (a + b * acc_rate).powi(2)
}
