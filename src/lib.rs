#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod artifact;
mod error;
mod graph;
pub mod habitat;
mod hash;
mod kernel;
pub mod pipeline;
pub mod quality;
mod raster;
mod scenario;
mod task;
mod vector;

pub use crate::artifact::{ArtifactKey, ArtifactStore};
pub use crate::error::{ConfigError, GeoError, ModelError, TableKind, TaskError};
pub use crate::graph::{Diagnostics, TaskGraph, TaskHandle};
pub use crate::hash::Hash32;
pub use crate::kernel::{INDEX_NODATA, KernelSpec};
pub use crate::pipeline::{PollinationConfig, RunSummary, ValidationWarning};
pub use crate::raster::{RARITY_NODATA, Raster, RasterMeta};
pub use crate::scenario::ScenarioVariables;
pub use crate::task::Op;
pub use crate::vector::{FarmAttribute, FarmFeature, FarmResults, FarmVector};

/// Install a global tracing subscriber printing events to stderr. Intended
/// for binaries and examples; libraries embedding this crate should install
/// their own.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
