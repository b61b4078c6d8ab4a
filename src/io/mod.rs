/*!
# Trace Storage

Append-only per-chain record stores for the draws of a stage.

Every stage opens one [`ChainTrace`] per chain through a [`TraceBackend`],
calls [`ChainTrace::setup`], records one row per draw (the flat point followed
by the flat forward-model outputs) and finally [`ChainTrace::close`]s it. Closing
returns the recorded rows, read back from the backend, so that the sampler
only ever sees data that has actually been stored. The closed chains of a
stage form a [`MultiTrace`].

Two backends are provided: [`MemoryBackend`] and, with the `csv` feature,
[`csv::CsvBackend`], which writes `chain-<i>.csv` files into the stage
directory.
*/

#[cfg(feature = "csv")]
pub mod csv;

use std::ops::Range;
use std::path::Path;

use ndarray::{s, Array2, Axis};

use crate::error::{AtmipError, Result};
use crate::space::ParameterSpace;

/// Column layout of a trace row: sampled variables, then model outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceLayout {
    pub params: ParameterSpace,
    pub outputs: ParameterSpace,
}

impl TraceLayout {
    pub fn new(params: ParameterSpace, outputs: ParameterSpace) -> Self {
        Self { params, outputs }
    }

    pub fn n_columns(&self) -> usize {
        self.params.dimensions() + self.outputs.dimensions()
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut names = self.params.column_names();
        names.extend(self.outputs.column_names());
        names
    }

    /// Columns holding `name`. Sampled variables shadow outputs of the same
    /// name.
    pub fn locate(&self, name: &str) -> Option<Range<usize>> {
        self.params.slice_of(name).or_else(|| {
            let offset = self.params.dimensions();
            self.outputs
                .slice_of(name)
                .map(|r| (r.start + offset)..(r.end + offset))
        })
    }

    fn check_row(&self, point: &[f64], outputs: &[f64]) -> Result<()> {
        self.params.check_len(point.len(), "trace point")?;
        self.outputs.check_len(outputs.len(), "trace outputs")
    }
}

/// Recorded draws of one chain, `n_draws × n_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSamples {
    pub chain: usize,
    pub draws: Array2<f64>,
}

/// Record store of a single chain.
pub trait ChainTrace: Send {
    /// Prepares storage for `n_draws` rows of chain `chain`.
    fn setup(&mut self, n_draws: usize, chain: usize) -> Result<()>;

    /// Appends one draw.
    fn record(&mut self, point: &[f64], outputs: &[f64]) -> Result<()>;

    /// Finishes the chain and returns what was stored.
    fn close(self) -> Result<ChainSamples>
    where
        Self: Sized;
}

/// Factory of per-chain traces.
pub trait TraceBackend: Sync {
    type Chain: ChainTrace;

    /// Opens a trace for a chain of the stage stored under `stage_path`.
    fn new_chain(&self, stage_path: Option<&Path>, layout: &TraceLayout) -> Result<Self::Chain>;
}

/// Keeps every draw in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

impl TraceBackend for MemoryBackend {
    type Chain = MemoryChainTrace;

    fn new_chain(&self, _stage_path: Option<&Path>, layout: &TraceLayout) -> Result<Self::Chain> {
        Ok(MemoryChainTrace::new(layout.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryChainTrace {
    layout: TraceLayout,
    chain: usize,
    values: Vec<f64>,
    n_rows: usize,
}

impl MemoryChainTrace {
    pub fn new(layout: TraceLayout) -> Self {
        Self {
            layout,
            chain: 0,
            values: Vec::new(),
            n_rows: 0,
        }
    }
}

impl ChainTrace for MemoryChainTrace {
    fn setup(&mut self, n_draws: usize, chain: usize) -> Result<()> {
        self.chain = chain;
        self.values = Vec::with_capacity(n_draws * self.layout.n_columns());
        self.n_rows = 0;
        Ok(())
    }

    fn record(&mut self, point: &[f64], outputs: &[f64]) -> Result<()> {
        self.layout.check_row(point, outputs)?;
        self.values.extend_from_slice(point);
        self.values.extend_from_slice(outputs);
        self.n_rows += 1;
        Ok(())
    }

    fn close(self) -> Result<ChainSamples> {
        let draws = Array2::from_shape_vec((self.n_rows, self.layout.n_columns()), self.values)
            .map_err(|e| AtmipError::Numerical(format!("trace shape: {e}")))?;
        Ok(ChainSamples {
            chain: self.chain,
            draws,
        })
    }
}

/// The closed traces of all chains of one stage, ordered by chain index.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiTrace {
    layout: TraceLayout,
    chains: Vec<ChainSamples>,
}

impl MultiTrace {
    pub fn new(layout: TraceLayout, mut chains: Vec<ChainSamples>) -> Result<Self> {
        chains.sort_by_key(|c| c.chain);
        for c in &chains {
            if c.draws.ncols() != layout.n_columns() {
                return Err(AtmipError::DimensionMismatch {
                    context: format!("trace columns of chain {}", c.chain),
                    expected: layout.n_columns(),
                    found: c.draws.ncols(),
                });
            }
        }
        Ok(Self { layout, chains })
    }

    pub fn layout(&self) -> &TraceLayout {
        &self.layout
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Number of draws of the shortest chain.
    pub fn len(&self) -> usize {
        self.chains.iter().map(|c| c.draws.nrows()).min().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chain(&self, chain: usize) -> Option<&ChainSamples> {
        self.chains.iter().find(|c| c.chain == chain)
    }

    /**
    Values of `name` recorded after the first `burn` draws of every chain.

    Rows are stacked chain after chain, columns are the flattened entries of
    the variable. With `burn = len() - 1` this returns the end-point of every
    chain.
    */
    pub fn get_values(&self, name: &str, burn: usize) -> Result<Array2<f64>> {
        let cols = self.layout.locate(name).ok_or_else(|| {
            AtmipError::Configuration(format!("trace has no variable `{name}`"))
        })?;
        let views: Vec<_> = self
            .chains
            .iter()
            .map(|c| {
                let start = burn.min(c.draws.nrows());
                c.draws.slice(s![start.., cols.clone()])
            })
            .collect();
        if views.is_empty() {
            return Ok(Array2::zeros((0, cols.len())));
        }
        ndarray::concatenate(Axis(0), &views)
            .map_err(|e| AtmipError::Numerical(format!("stacking trace values: {e}")))
    }

    /// Last recorded point and outputs of every chain, by chain index.
    pub fn endpoints(&self) -> Result<(Array2<f64>, Vec<Vec<f64>>)> {
        let d = self.layout.params.dimensions();
        let mut points = Array2::zeros((self.chains.len(), d));
        let mut outputs = Vec::with_capacity(self.chains.len());
        for (i, c) in self.chains.iter().enumerate() {
            let n = c.draws.nrows();
            if n == 0 {
                return Err(AtmipError::Numerical(format!(
                    "chain {} recorded no draws",
                    c.chain
                )));
            }
            let last = c.draws.row(n - 1);
            points.row_mut(i).assign(&last.slice(s![..d]));
            outputs.push(last.slice(s![d..]).to_vec());
        }
        Ok((points, outputs))
    }
}
