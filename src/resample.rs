//! Kitagawa's deterministic (stratified) resampling.
//!
//! A single uniform offset `u0` places `n` evenly spaced points
//! `(i + u0) / n` on the cumulative weight distribution. Parent `i` receives
//! one child per point that falls into its cumulative interval, so the child
//! count is `n * w[i]` rounded up or down.

use ndarray::ArrayView1;
use rand::Rng;

/// Draws parent indices for the next stage from normalized `weights`.
///
/// Children are emitted in parent order. The result always has the same
/// length as `weights` and only contains valid indices.
pub fn resample<R: Rng + ?Sized>(weights: ArrayView1<f64>, rng: &mut R) -> Vec<usize> {
    let u0: f64 = rng.gen();
    resample_with_offset(weights, u0)
}

/// [`resample`] with an explicit offset `u0 ∈ [0, 1)`.
pub fn resample_with_offset(weights: ArrayView1<f64>, u0: f64) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }

    let mut cum_dist = Vec::with_capacity(n);
    let mut acc = 0.0;
    for w in weights.iter() {
        acc += w.max(0.0);
        cum_dist.push(acc);
    }
    // Floating point round-off must not push the last points past the end.
    let total = acc;
    for c in cum_dist.iter_mut() {
        *c /= total;
    }
    cum_dist[n - 1] = 1.0;

    let mut out = Vec::with_capacity(n);
    let mut j = 0;
    for i in 0..n {
        let u = (i as f64 + u0) / n as f64;
        while u > cum_dist[j] && j < n - 1 {
            j += 1;
        }
        out.push(j);
    }
    out
}

/// Number of children of every parent in an index map of length `n`.
pub fn child_counts(indices: &[usize], n: usize) -> Vec<usize> {
    let mut counts = vec![0; n];
    for &i in indices {
        counts[i] += 1;
    }
    counts
}
