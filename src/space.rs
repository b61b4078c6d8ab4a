/*!
# Parameter Space

Maps named, possibly mixed discrete/continuous parameter points onto flat
`f64` vectors and back.

A [`ParameterSpace`] is an ordered list of [`VarSpec`]s. Each variable owns a
contiguous slice of the flat vector, in declaration order. The ordering table
is built once and never changes for the lifetime of a run, so the flat
population matrix and the dictionary-shaped population always agree.

The same type describes the named outputs of a forward model (likelihood,
bound density, auxiliary deterministic quantities).

## Example

```rust
use atmip::space::{ParameterSpace, VarSpec};
use ndarray::{arr0, arr1};

let space = ParameterSpace::new(vec![
    VarSpec::continuous("depth", &[]),
    VarSpec::continuous("slip", &[2]),
    VarSpec::discrete("n_patches", &[]),
])
.unwrap();
assert_eq!(space.dimensions(), 4);

let mut point = atmip::space::Point::new();
point.insert("depth".into(), arr0(3.5).into_dyn());
point.insert("slip".into(), arr1(&[0.5, 1.5]).into_dyn());
point.insert("n_patches".into(), arr0(4.0).into_dyn());

let flat = space.flatten(&point).unwrap();
assert_eq!(flat, vec![3.5, 0.5, 1.5, 4.0]);
assert_eq!(space.unflatten(&flat).unwrap(), point);
```
*/

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{AtmipError, Result};

/// A dictionary-shaped parameter point: variable name to numeric array.
/// Scalars are zero-dimensional arrays.
pub type Point = BTreeMap<String, ArrayD<f64>>;

/// Whether a variable takes continuous or integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    Continuous,
    Discrete,
}

/// Declaration of one named variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: VarKind,
}

impl VarSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], kind: VarKind) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            kind,
        }
    }

    pub fn continuous(name: impl Into<String>, shape: &[usize]) -> Self {
        Self::new(name, shape, VarKind::Continuous)
    }

    pub fn discrete(name: impl Into<String>, shape: &[usize]) -> Self {
        Self::new(name, shape, VarKind::Discrete)
    }

    /// Number of flat entries; 1 for a scalar.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VarSlot {
    spec: VarSpec,
    start: usize,
    end: usize,
}

/// Ordering table between named variables and a flat vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpace {
    slots: Vec<VarSlot>,
    dimensions: usize,
}

impl ParameterSpace {
    /// Builds the ordering table. Variable names must be unique.
    pub fn new(vars: Vec<VarSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(vars.len());
        let mut offset = 0;
        for spec in vars {
            if !seen.insert(spec.name.clone()) {
                return Err(AtmipError::Configuration(format!(
                    "variable `{}` declared twice",
                    spec.name
                )));
            }
            let size = spec.size();
            slots.push(VarSlot {
                spec,
                start: offset,
                end: offset + size,
            });
            offset += size;
        }
        Ok(Self {
            slots,
            dimensions: offset,
        })
    }

    /// Total flattened dimensionality `d`.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn vars(&self) -> impl Iterator<Item = &VarSpec> {
        self.slots.iter().map(|s| &s.spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.iter().any(|s| s.spec.name == name)
    }

    /// Slice of the flat vector owned by `name`.
    pub fn slice_of(&self, name: &str) -> Option<Range<usize>> {
        self.slots
            .iter()
            .find(|s| s.spec.name == name)
            .map(|s| s.start..s.end)
    }

    pub fn spec_of(&self, name: &str) -> Option<&VarSpec> {
        self.slots
            .iter()
            .find(|s| s.spec.name == name)
            .map(|s| &s.spec)
    }

    /// Kind of every flat dimension, in flat order.
    pub fn dim_kinds(&self) -> Vec<VarKind> {
        self.slots
            .iter()
            .flat_map(|s| std::iter::repeat(s.spec.kind).take(s.end - s.start))
            .collect()
    }

    pub fn any_discrete(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.spec.kind == VarKind::Discrete && s.end > s.start)
    }

    pub fn all_discrete(&self) -> bool {
        self.dimensions > 0
            && self
                .slots
                .iter()
                .all(|s| s.spec.kind == VarKind::Discrete || s.end == s.start)
    }

    /// Flat column labels. Scalars keep their name, arrays get `name__i`
    /// suffixes in row-major order.
    pub fn column_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .flat_map(|s| {
                let name = &s.spec.name;
                if s.spec.shape.is_empty() {
                    vec![name.clone()]
                } else {
                    (0..s.end - s.start)
                        .map(|i| format!("{name}__{i}"))
                        .collect()
                }
            })
            .collect()
    }

    /// Concatenates the variables of `point` in declaration order.
    /// Entries of `point` that are not declared are ignored.
    pub fn flatten(&self, point: &Point) -> Result<Vec<f64>> {
        let mut flat = Vec::with_capacity(self.dimensions);
        for slot in &self.slots {
            let value = point.get(&slot.spec.name).ok_or_else(|| {
                AtmipError::Configuration(format!(
                    "point is missing variable `{}`",
                    slot.spec.name
                ))
            })?;
            if value.shape() != slot.spec.shape.as_slice() {
                return Err(AtmipError::DimensionMismatch {
                    context: format!("shape of `{}`", slot.spec.name),
                    expected: slot.spec.size(),
                    found: value.len(),
                });
            }
            flat.extend(value.iter().copied());
        }
        Ok(flat)
    }

    /// Rebuilds a point from a flat vector of length `d`.
    pub fn unflatten(&self, flat: &[f64]) -> Result<Point> {
        self.check_len(flat.len(), "unflatten")?;
        self.slots
            .iter()
            .map(|slot| {
                let values = flat[slot.start..slot.end].to_vec();
                let array = ArrayD::from_shape_vec(IxDyn(&slot.spec.shape), values).map_err(
                    |_| AtmipError::DimensionMismatch {
                        context: format!("shape of `{}`", slot.spec.name),
                        expected: slot.spec.size(),
                        found: slot.end - slot.start,
                    },
                )?;
                Ok((slot.spec.name.clone(), array))
            })
            .collect()
    }

    /// Values of `name` inside a flat vector.
    pub fn values<'a>(&self, name: &str, flat: &'a [f64]) -> Result<&'a [f64]> {
        self.check_len(flat.len(), "values")?;
        let range = self.slice_of(name).ok_or_else(|| {
            AtmipError::Configuration(format!("unknown variable `{name}`"))
        })?;
        Ok(&flat[range])
    }

    pub(crate) fn check_len(&self, len: usize, context: &str) -> Result<()> {
        if len != self.dimensions {
            return Err(AtmipError::DimensionMismatch {
                context: context.to_string(),
                expected: self.dimensions,
                found: len,
            });
        }
        Ok(())
    }
}
