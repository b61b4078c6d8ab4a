//! The forward-model contract the sampler drives.
//!
//! The sampler never looks inside a forward model. It only needs the layout of
//! its inputs and named outputs, a cheap bound log-density for early
//! rejection, the full evaluation, and prior draws for the initial population.

use rand::RngCore;

use crate::error::{AtmipError, Result};
use crate::space::ParameterSpace;

/// A black-box model evaluated at flat parameter vectors.
///
/// Implementations are called concurrently from the worker pool and must not
/// rely on shared mutable state.
pub trait ForwardModel: Sync {
    /// Layout of the sampled variables.
    fn space(&self) -> &ParameterSpace;

    /// Layout of the named outputs returned by [`ForwardModel::evaluate`].
    /// Must contain the scalar log-likelihood under the sampler's
    /// `likelihood_name`.
    fn outputs(&self) -> &ParameterSpace;

    /// Cheap prior/bounds log-density at `q`. Non-finite values reject the
    /// candidate without running the forward model.
    fn log_bound(&self, q: &[f64]) -> f64;

    /// Evaluates all named outputs at `q`, flattened in `outputs()` order.
    fn evaluate(&self, q: &[f64]) -> Vec<f64>;

    /// Draws one point of the initial population from the prior.
    fn sample_prior(&self, rng: &mut dyn RngCore) -> Vec<f64>;
}

/// Position of the scalar likelihood inside the flat outputs of `model`.
pub fn likelihood_index<M: ForwardModel + ?Sized>(model: &M, name: &str) -> Result<usize> {
    let outputs = model.outputs();
    let range = outputs.slice_of(name).ok_or_else(|| {
        AtmipError::Configuration(format!(
            "model outputs need to contain a variable `{name}` holding the likelihood"
        ))
    })?;
    if range.len() != 1 {
        return Err(AtmipError::Configuration(format!(
            "likelihood output `{name}` must be a scalar, has {} entries",
            range.len()
        )));
    }
    Ok(range.start)
}

/// Evaluates `model` and checks the length of the returned outputs.
pub(crate) fn evaluate_checked<M: ForwardModel + ?Sized>(model: &M, q: &[f64]) -> Result<Vec<f64>> {
    let out = model.evaluate(q);
    model.outputs().check_len(out.len(), "forward model outputs")?;
    Ok(out)
}
