/*!
# CSV Trace Backend

Writes the draws of every chain of a stage to `<stage dir>/chain-<i>.csv`.
Enable via the `csv` feature.

The header holds `"draw"` followed by one column per flattened variable
(`x`, `v__0`, `v__1`, ..., then the model outputs). Values are written with
Rust's shortest round-trip float formatting, so reading a chain back yields the
exact recorded values.

# Examples

```rust
use atmip::io::csv::CsvBackend;
use atmip::io::{ChainTrace, TraceBackend, TraceLayout};
use atmip::space::{ParameterSpace, VarSpec};

let layout = TraceLayout::new(
    ParameterSpace::new(vec![VarSpec::continuous("x", &[])])?,
    ParameterSpace::new(vec![VarSpec::continuous("like", &[])])?,
);
let dir = std::env::temp_dir().join("atmip_csv_doc");
let mut trace = CsvBackend.new_chain(Some(&dir), &layout)?;
trace.setup(2, 0)?;
trace.record(&[0.25], &[-1.5])?;
trace.record(&[0.5], &[-1.0])?;
let samples = trace.close()?;
assert_eq!(samples.draws[[1, 0]], 0.5);
# Ok::<(), atmip::AtmipError>(())
```
*/

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::{Reader, Writer};
use ndarray::Array2;

use super::{ChainSamples, ChainTrace, TraceBackend, TraceLayout};
use crate::error::{AtmipError, Result};

/// File name of the trace of chain `chain`.
pub fn chain_file_name(chain: usize) -> String {
    format!("chain-{chain}.csv")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvBackend;

impl TraceBackend for CsvBackend {
    type Chain = CsvChainTrace;

    fn new_chain(&self, stage_path: Option<&Path>, layout: &TraceLayout) -> Result<Self::Chain> {
        let dir = stage_path.ok_or_else(|| {
            AtmipError::Configuration("the csv trace backend needs an output directory".into())
        })?;
        fs::create_dir_all(dir).map_err(|e| AtmipError::storage(dir, e))?;
        Ok(CsvChainTrace {
            dir: dir.to_path_buf(),
            layout: layout.clone(),
            chain: 0,
            writer: None,
            n_rows: 0,
        })
    }
}

pub struct CsvChainTrace {
    dir: PathBuf,
    layout: TraceLayout,
    chain: usize,
    writer: Option<Writer<File>>,
    n_rows: usize,
}

impl CsvChainTrace {
    pub fn path(&self) -> PathBuf {
        self.dir.join(chain_file_name(self.chain))
    }
}

impl ChainTrace for CsvChainTrace {
    fn setup(&mut self, _n_draws: usize, chain: usize) -> Result<()> {
        self.chain = chain;
        self.n_rows = 0;
        let path = self.path();
        let file = File::create(&path).map_err(|e| AtmipError::storage(&path, e))?;
        let mut wtr = Writer::from_writer(file);

        let mut header = vec!["draw".to_string()];
        header.extend(self.layout.column_names());
        wtr.write_record(&header)
            .map_err(|e| AtmipError::storage(&path, e))?;
        self.writer = Some(wtr);
        Ok(())
    }

    fn record(&mut self, point: &[f64], outputs: &[f64]) -> Result<()> {
        self.layout.check_row(point, outputs)?;
        let path = self.path();
        let wtr = self.writer.as_mut().ok_or_else(|| {
            AtmipError::storage(&path, "record called before setup".to_string())
        })?;
        let mut row = Vec::with_capacity(1 + point.len() + outputs.len());
        row.push(self.n_rows.to_string());
        row.extend(point.iter().chain(outputs).map(|v| v.to_string()));
        wtr.write_record(&row)
            .map_err(|e| AtmipError::storage(&path, e))?;
        self.n_rows += 1;
        Ok(())
    }

    fn close(mut self) -> Result<ChainSamples> {
        let path = self.path();
        if let Some(mut wtr) = self.writer.take() {
            wtr.flush().map_err(|e| AtmipError::storage(&path, e))?;
        }
        let draws = read_chain(&path, self.layout.n_columns())?;
        Ok(ChainSamples {
            chain: self.chain,
            draws,
        })
    }
}

/// Reads a chain file written by [`CsvChainTrace`], dropping the draw column.
pub fn read_chain(path: &Path, n_columns: usize) -> Result<Array2<f64>> {
    let mut rdr = Reader::from_path(path).map_err(|e| AtmipError::storage(path, e))?;
    let mut values = Vec::new();
    let mut n_rows = 0;
    for record in rdr.records() {
        let record = record.map_err(|e| AtmipError::storage(path, e))?;
        if record.len() != n_columns + 1 {
            return Err(AtmipError::DimensionMismatch {
                context: format!("columns of {}", path.display()),
                expected: n_columns + 1,
                found: record.len(),
            });
        }
        for field in record.iter().skip(1) {
            let v: f64 = field
                .trim()
                .parse()
                .map_err(|e| AtmipError::storage(path, e))?;
            values.push(v);
        }
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_columns), values)
        .map_err(|e| AtmipError::Numerical(format!("trace shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ParameterSpace, VarSpec};
    use tempfile::tempdir;

    fn layout() -> TraceLayout {
        TraceLayout::new(
            ParameterSpace::new(vec![VarSpec::continuous("v", &[2])]).unwrap(),
            ParameterSpace::new(vec![VarSpec::continuous("like", &[])]).unwrap(),
        )
    }

    #[test]
    fn test_csv_chain_round_trip() {
        let dir = tempdir().unwrap();
        let stage = dir.path().join("stage_0");
        let mut trace = CsvBackend.new_chain(Some(&stage), &layout()).unwrap();
        trace.setup(3, 7).unwrap();
        let rows = [
            [0.1, -2.0 / 3.0, -12.345_678_9],
            [1e-300, 3.0, f64::NEG_INFINITY],
            [0.3, 0.7, -1.0],
        ];
        for r in &rows {
            trace.record(&r[..2], &r[2..]).unwrap();
        }
        let samples = trace.close().unwrap();

        assert_eq!(samples.chain, 7);
        assert_eq!(samples.draws.dim(), (3, 3));
        for (i, r) in rows.iter().enumerate() {
            assert_eq!(samples.draws.row(i).to_vec(), r.to_vec());
        }

        let text = std::fs::read_to_string(stage.join("chain-7.csv")).unwrap();
        assert!(text.starts_with("draw,v__0,v__1,like"));
    }

    #[test]
    fn test_csv_needs_directory() {
        assert!(matches!(
            CsvBackend.new_chain(None, &layout()),
            Err(AtmipError::Configuration(_))
        ));
    }
}
