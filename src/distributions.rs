/*!
Proposal and prior distributions used by the ATMIP sampler.

The sampler only needs one proposal: a zero-mean multivariate normal whose
covariance is re-estimated from the weighted ensemble after every stage
([`MvNormalProposal`]). The priors in this module are small building blocks for
forward models: they draw the initial population and provide the cheap bound
log-density used to reject out-of-support candidates before the forward model
runs.

# Examples

```rust
use atmip::distributions::{MvNormalProposal, Prior, Uniform};
use ndarray::arr2;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut rng = SmallRng::seed_from_u64(42);

let proposal = MvNormalProposal::new(&arr2(&[[2.0, 0.5], [0.5, 1.0]])).unwrap();
let deltas = proposal.sample(10, &mut rng);
assert_eq!(deltas.shape(), &[10, 2]);

let prior = Uniform::new(-1.0, 1.0).unwrap();
let x = prior.sample(&mut rng);
assert!(prior.log_prob(x).is_finite());
assert_eq!(prior.log_prob(3.0), f64::NEG_INFINITY);
```
*/

use approx::relative_eq;
use nalgebra as na;
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{AtmipError, Result};

/// A one-dimensional prior: draws values and evaluates their log-density.
pub trait Prior {
    /// Draws one value.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64;

    /// Normalized log-density; `-inf` outside the support.
    fn log_prob(&self, x: f64) -> f64;
}

/**
A zero-mean multivariate normal proposal parameterized by a covariance matrix.

Construction validates the matrix and keeps its lower Cholesky factor `L`;
draws are `L · z` with `z ~ N(0, I)`.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct MvNormalProposal {
    cov: Array2<f64>,
    chol: Array2<f64>,
}

impl MvNormalProposal {
    /// Builds a proposal from `cov`.
    ///
    /// Fails with [`AtmipError::InvalidCovariance`] when the matrix is not
    /// square, contains NaN/Inf, is not symmetric, or is not positive definite.
    pub fn new(cov: &Array2<f64>) -> Result<Self> {
        let chol = cholesky_lower(cov.view())?;
        Ok(Self {
            cov: cov.clone(),
            chol,
        })
    }

    /// Identity-covariance proposal in `d` dimensions.
    pub fn identity(d: usize) -> Self {
        Self {
            cov: Array2::eye(d),
            chol: Array2::eye(d),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.cov.nrows()
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.cov
    }

    /// Draws `k` independent proposal deltas as a `k × d` matrix.
    pub fn sample<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Array2<f64> {
        let d = self.dimensions();
        let z: Array2<f64> = Array2::from_shape_simple_fn((k, d), || StandardNormal.sample(rng));
        z.dot(&self.chol.t())
    }
}

/// Checks that `cov` can parameterize a multivariate normal and returns its
/// lower Cholesky factor.
pub fn cholesky_lower(cov: ArrayView2<f64>) -> Result<Array2<f64>> {
    let (n, m) = cov.dim();
    if n != m {
        return Err(AtmipError::InvalidCovariance(format!(
            "matrix is {n}x{m}, expected square"
        )));
    }
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(AtmipError::InvalidCovariance(
            "matrix contains NaN or infinite entries".into(),
        ));
    }
    for i in 0..n {
        for j in (i + 1)..n {
            if !relative_eq!(cov[[i, j]], cov[[j, i]], epsilon = 1e-12, max_relative = 1e-8) {
                return Err(AtmipError::InvalidCovariance(format!(
                    "matrix is not symmetric at ({i}, {j})"
                )));
            }
        }
    }
    let mat = na::DMatrix::from_fn(n, n, |i, j| cov[[i, j]]);
    let chol = mat.cholesky().ok_or_else(|| {
        AtmipError::InvalidCovariance("matrix is not positive definite".into())
    })?;
    let l = chol.l();
    if (0..n).any(|i| !(l[(i, i)].is_finite() && l[(i, i)] > 0.0)) {
        return Err(AtmipError::InvalidCovariance(
            "matrix is not positive definite".into(),
        ));
    }
    Ok(Array2::from_shape_fn((n, n), |(i, j)| l[(i, j)]))
}

/// Continuous uniform prior on `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniform {
    pub lower: f64,
    pub upper: f64,
}

impl Uniform {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        if !(lower.is_finite() && upper.is_finite() && lower < upper) {
            return Err(AtmipError::Configuration(format!(
                "invalid uniform bounds [{lower}, {upper}]"
            )));
        }
        Ok(Self { lower, upper })
    }
}

impl Prior for Uniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        rng.gen_range(self.lower..self.upper)
    }

    fn log_prob(&self, x: f64) -> f64 {
        if x >= self.lower && x <= self.upper {
            -(self.upper - self.lower).ln()
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Normal prior with mean `mu` and standard deviation `sigma`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    pub mu: f64,
    pub sigma: f64,
}

impl Normal {
    pub fn new(mu: f64, sigma: f64) -> Result<Self> {
        if !(mu.is_finite() && sigma.is_finite() && sigma > 0.0) {
            return Err(AtmipError::Configuration(format!(
                "invalid normal parameters mu={mu}, sigma={sigma}"
            )));
        }
        Ok(Self { mu, sigma })
    }
}

impl Prior for Normal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let z: f64 = StandardNormal.sample(rng);
        self.mu + self.sigma * z
    }

    fn log_prob(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.sigma;
        -0.5 * z * z - self.sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
    }
}

/// Uniform prior over the integers `lower..=upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscreteUniform {
    pub lower: i64,
    pub upper: i64,
}

impl DiscreteUniform {
    pub fn new(lower: i64, upper: i64) -> Result<Self> {
        if lower > upper {
            return Err(AtmipError::Configuration(format!(
                "invalid discrete bounds [{lower}, {upper}]"
            )));
        }
        Ok(Self { lower, upper })
    }
}

impl Prior for DiscreteUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        rng.gen_range(self.lower..=self.upper) as f64
    }

    fn log_prob(&self, x: f64) -> f64 {
        if x.fract() == 0.0 && x >= self.lower as f64 && x <= self.upper as f64 {
            -(((self.upper - self.lower) + 1) as f64).ln()
        } else {
            f64::NEG_INFINITY
        }
    }
}
