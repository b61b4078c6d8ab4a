/*!
# Ensemble State

Everything the sampler knows between two stages, as one serializable value.

The state holds the flat population (`n_chains × d`), the likelihood vector,
the current importance weights, the proposal covariance and scaling, the
resampling map, and the outputs at every lineage's previous accepted point.
Stage transitions never mutate a state in place: [`EnsembleState::advance`]
consumes the result of a stage and returns the next snapshot, which is what
gets checkpointed.
*/

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{AtmipError, Result};
use crate::space::{ParameterSpace, Point};

/// Snapshot of the ensemble at a stage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleState {
    /// Index of the stage this snapshot belongs to.
    pub stage: usize,
    /// Tempering exponent used to sample the next stage.
    pub beta: f64,
    /// Exponent the current population was sampled at.
    pub old_beta: f64,
    /// Seed from which all stage and chain RNGs are derived.
    pub seed: u64,
    /// End-points of the chains, one row per chain.
    pub population: Array2<f64>,
    /// Log-likelihood of every population row.
    #[serde(with = "float_codec::vector")]
    pub likelihoods: Array1<f64>,
    /// Normalized importance weights of the population.
    #[serde(with = "float_codec::vector")]
    pub weights: Array1<f64>,
    /// Covariance of the proposal distribution.
    pub covariance: Array2<f64>,
    /// Multiplier applied to proposal draws at the start of every chain.
    pub scaling: f64,
    /// Parent index of every chain slot for the next stage.
    pub resampling_indexes: Vec<usize>,
    /// Forward-model outputs at each chain slot's previous accepted point.
    #[serde(with = "float_codec::rows")]
    pub lineage_outputs: Vec<Vec<f64>>,
}

/// What a completed stage hands back to the state.
#[derive(Debug, Clone)]
pub struct StageEndpoints {
    pub population: Array2<f64>,
    pub likelihoods: Array1<f64>,
    pub outputs: Vec<Vec<f64>>,
}

impl EnsembleState {
    /// Stage-0 state from a flat starting population.
    pub fn initial(population: Array2<f64>, scaling: f64, seed: u64) -> Self {
        let (n_chains, d) = population.dim();
        Self {
            stage: 0,
            beta: 0.0,
            old_beta: 0.0,
            seed,
            population,
            likelihoods: Array1::zeros(n_chains),
            weights: Array1::from_elem(n_chains, 1.0 / n_chains as f64),
            covariance: Array2::eye(d),
            scaling,
            resampling_indexes: (0..n_chains).collect(),
            lineage_outputs: vec![Vec::new(); n_chains],
        }
    }

    pub fn n_chains(&self) -> usize {
        self.population.nrows()
    }

    pub fn dimensions(&self) -> usize {
        self.population.ncols()
    }

    /// Starting point of chain slot `chain` for the next stage.
    pub fn start_point(&self, chain: usize) -> Vec<f64> {
        self.population
            .row(self.resampling_indexes[chain])
            .to_vec()
    }

    /// Outputs the lineage of `chain` compares candidates against.
    pub fn previous_outputs(&self, chain: usize) -> &[f64] {
        &self.lineage_outputs[chain]
    }

    /// Dictionary-shaped population.
    pub fn points(&self, space: &ParameterSpace) -> Result<Vec<Point>> {
        self.population
            .rows()
            .into_iter()
            .map(|row| space.unflatten(&row.to_vec()))
            .collect()
    }

    /// Unweighted mean of the chain end-points as a point.
    pub fn mean_point(&self, space: &ParameterSpace) -> Result<Point> {
        let mean = self
            .population
            .mean_axis(Axis(0))
            .ok_or_else(|| AtmipError::Numerical("empty population".into()))?;
        space.unflatten(&mean.to_vec())
    }

    /// Replaces population, likelihoods and lineage outputs with the
    /// end-points of the stage that was just sampled.
    ///
    /// The returned state still carries the old exponent and resampling map.
    pub fn with_endpoints(&self, endpoints: StageEndpoints) -> Result<Self> {
        let n = self.n_chains();
        if endpoints.population.dim() != self.population.dim() {
            return Err(AtmipError::DimensionMismatch {
                context: "stage end-points".into(),
                expected: self.population.len(),
                found: endpoints.population.len(),
            });
        }
        if endpoints.likelihoods.len() != n || endpoints.outputs.len() != n {
            return Err(AtmipError::DimensionMismatch {
                context: "stage likelihoods".into(),
                expected: n,
                found: endpoints.likelihoods.len().min(endpoints.outputs.len()),
            });
        }
        Ok(Self {
            population: endpoints.population,
            likelihoods: endpoints.likelihoods,
            lineage_outputs: endpoints.outputs,
            ..self.clone()
        })
    }

    /**
    Produces the state the next stage starts from.

    The lineage outputs are re-indexed through `resampling_indexes`, so that
    chain slot `i` of the next stage compares against the outputs of its new
    parent.
    */
    pub fn advance(
        &self,
        beta: f64,
        old_beta: f64,
        weights: Array1<f64>,
        covariance: Array2<f64>,
        resampling_indexes: Vec<usize>,
    ) -> Result<Self> {
        let n = self.n_chains();
        if weights.len() != n || resampling_indexes.len() != n {
            return Err(AtmipError::DimensionMismatch {
                context: "resampling".into(),
                expected: n,
                found: weights.len().min(resampling_indexes.len()),
            });
        }
        if let Some(&bad) = resampling_indexes.iter().find(|&&i| i >= n) {
            return Err(AtmipError::Numerical(format!(
                "resampling produced invalid parent index {bad}"
            )));
        }
        let lineage_outputs = resampling_indexes
            .iter()
            .map(|&parent| self.lineage_outputs[parent].clone())
            .collect();
        Ok(Self {
            beta,
            old_beta,
            weights,
            covariance,
            resampling_indexes,
            lineage_outputs,
            ..self.clone()
        })
    }

    /// Same state with the stage counter moved to `stage`.
    pub fn at_stage(&self, stage: usize) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

/// Likelihoods and model outputs may be `-inf` or NaN, which JSON numbers
/// cannot hold. Those values are written as the strings `"inf"`, `"-inf"` and
/// `"NaN"`.
mod float_codec {
    use std::fmt;

    use ndarray::Array1;
    use serde::de::{self, Deserializer, Visitor};
    use serde::{Deserialize, Serialize, Serializer};

    struct Float(f64);

    impl Serialize for Float {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let v = self.0;
            if v.is_finite() {
                serializer.serialize_f64(v)
            } else if v.is_nan() {
                serializer.serialize_str("NaN")
            } else if v > 0.0 {
                serializer.serialize_str("inf")
            } else {
                serializer.serialize_str("-inf")
            }
        }
    }

    impl<'de> Deserialize<'de> for Float {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(FloatVisitor)
        }
    }

    struct FloatVisitor;

    impl<'de> Visitor<'de> for FloatVisitor {
        type Value = Float;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number or one of \"inf\", \"-inf\", \"NaN\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Float, E> {
            Ok(Float(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Float, E> {
            Ok(Float(v as f64))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Float, E> {
            Ok(Float(v as f64))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Float, E> {
            match v {
                "inf" => Ok(Float(f64::INFINITY)),
                "-inf" => Ok(Float(f64::NEG_INFINITY)),
                "NaN" => Ok(Float(f64::NAN)),
                _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
            }
        }
    }

    pub mod vector {
        use super::*;

        pub fn serialize<S: Serializer>(values: &Array1<f64>, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(values.iter().map(|v| Float(*v)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array1<f64>, D::Error> {
            let values = Vec::<Float>::deserialize(deserializer)?;
            Ok(values.into_iter().map(|f| f.0).collect())
        }
    }

    pub mod rows {
        use super::*;

        pub fn serialize<S: Serializer>(rows: &[Vec<f64>], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(
                rows.iter()
                    .map(|row| row.iter().map(|v| Float(*v)).collect::<Vec<_>>()),
            )
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<f64>>, D::Error> {
            let rows = Vec::<Vec<Float>>::deserialize(deserializer)?;
            Ok(rows
                .into_iter()
                .map(|row| row.into_iter().map(|f| f.0).collect())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::VarSpec;
    use ndarray::{arr1, arr2};

    fn three_chain_state() -> EnsembleState {
        EnsembleState::initial(arr2(&[[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]]), 1.0, 9)
    }

    #[test]
    fn test_initial_state() {
        let state = three_chain_state();
        assert_eq!(state.n_chains(), 3);
        assert_eq!(state.dimensions(), 2);
        assert_eq!(state.beta, 0.0);
        assert_eq!(state.covariance, Array2::<f64>::eye(2));
        assert_eq!(state.resampling_indexes, vec![0, 1, 2]);
        assert_eq!(state.start_point(1), vec![2.0, 3.0]);
    }

    #[test]
    fn test_advance_reindexes_lineages() {
        let state = three_chain_state()
            .with_endpoints(StageEndpoints {
                population: arr2(&[[0.5, 1.0], [2.5, 3.0], [4.5, 5.0]]),
                likelihoods: arr1(&[-1.0, -2.0, -3.0]),
                outputs: vec![vec![-1.0], vec![-2.0], vec![-3.0]],
            })
            .unwrap();
        let next = state
            .advance(
                0.2,
                0.0,
                arr1(&[0.6, 0.3, 0.1]),
                Array2::eye(2),
                vec![0, 0, 1],
            )
            .unwrap();

        assert_eq!(next.previous_outputs(0), &[-1.0]);
        assert_eq!(next.previous_outputs(1), &[-1.0]);
        assert_eq!(next.previous_outputs(2), &[-2.0]);
        assert_eq!(next.start_point(2), vec![2.5, 3.0]);
        // The input snapshot is untouched.
        assert_eq!(state.resampling_indexes, vec![0, 1, 2]);
        assert_eq!(state.beta, 0.0);
    }

    #[test]
    fn test_advance_rejects_bad_index() {
        let state = three_chain_state();
        let res = state.advance(0.1, 0.0, arr1(&[0.3, 0.3, 0.4]), Array2::eye(2), vec![0, 3, 1]);
        assert!(res.is_err());
    }

    #[test]
    fn test_mean_point() {
        let space = ParameterSpace::new(vec![VarSpec::continuous("x", &[2])]).unwrap();
        let state = three_chain_state();
        let mean = state.mean_point(&space).unwrap();
        assert_eq!(mean["x"].as_slice().unwrap(), &[2.0, 3.0]);
        assert_eq!(state.points(&space).unwrap().len(), 3);
    }

    #[test]
    fn test_serde_round_trip() {
        let state = three_chain_state();
        let json = serde_json::to_string(&state).unwrap();
        let back: EnsembleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_serde_keeps_non_finite_values() {
        let state = three_chain_state()
            .with_endpoints(StageEndpoints {
                population: arr2(&[[0.5, 1.0], [2.5, 3.0], [4.5, 5.0]]),
                likelihoods: arr1(&[f64::NEG_INFINITY, -2.0, f64::INFINITY]),
                outputs: vec![vec![f64::NEG_INFINITY, 1.5], vec![-2.0, f64::NAN], vec![f64::INFINITY, 0.0]],
            })
            .unwrap();
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("null"));

        let back: EnsembleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.likelihoods, state.likelihoods);
        assert_eq!(back.lineage_outputs[0], state.lineage_outputs[0]);
        assert_eq!(back.lineage_outputs[1][0], -2.0);
        assert!(back.lineage_outputs[1][1].is_nan());
        assert_eq!(back.lineage_outputs[2], state.lineage_outputs[2]);
    }

    #[test]
    fn test_serde_rejects_unknown_float_tag() {
        let mut json = serde_json::to_value(three_chain_state()).unwrap();
        json["likelihoods"][0] = serde_json::json!("minus infinity");
        assert!(serde_json::from_value::<EnsembleState>(json).is_err());
    }
}
