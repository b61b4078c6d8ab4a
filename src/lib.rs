pub mod checkpoint;
pub mod core;
pub mod distributions;
pub mod error;
pub mod io;
pub mod model;
pub mod observer;
pub mod resample;
pub mod sampler;
pub mod space;
pub mod state;
pub mod stats;
pub mod stepper;
pub mod tempering;

pub use error::{AtmipError, Result};
pub use model::ForwardModel;
pub use observer::StageObserver;
pub use sampler::{Atmip, SamplerConfig, SamplingResult};
pub use space::{ParameterSpace, Point, VarKind, VarSpec};
