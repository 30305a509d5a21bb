use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Which input table a configuration problem was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Guild,
    Biophysical,
    Farm,
    Threats,
    Sensitivity,
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKind::Guild => write!(f, "guild table"),
            TableKind::Biophysical => write!(f, "biophysical table"),
            TableKind::Farm => write!(f, "farm vector"),
            TableKind::Threats => write!(f, "threats table"),
            TableKind::Sensitivity => write!(f, "sensitivity table"),
        }
    }
}

/// Errors raised while assembling scenario variables, before any task is
/// scheduled. These are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Input file not found: {0}")]
    MissingFile(Utf8PathBuf),

    #[error("Couldn't read '{path}':\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The {table} is missing a required '{column}' column")]
    MissingColumn { table: TableKind, column: String },

    #[error("The {table} defines no columns matching '{pattern}'")]
    MissingPattern { table: TableKind, pattern: String },

    #[error("Row {row} of the {table} has {got} fields, expected {expected}")]
    RaggedRow {
        table: TableKind,
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("Duplicate key '{key}' in the {table}")]
    DuplicateKey { table: TableKind, key: String },

    #[error("Couldn't parse '{value}' in column '{column}' of the {table} as a number")]
    InvalidNumber {
        table: TableKind,
        column: String,
        value: String,
    },

    #[error("The {kind} '{name}' is referenced elsewhere but missing from the {table}")]
    NameMismatch {
        kind: &'static str,
        name: String,
        table: TableKind,
    },

    #[error("Farm features use season '{0}' which no table defines")]
    UnknownFarmSeason(String),

    #[error("All '{column}' values in the {table} sum to zero, cannot normalize")]
    ZeroWeightSum { table: TableKind, column: String },

    #[error("Farm vector '{0}': {1}")]
    FarmVector(Utf8PathBuf, GeoError),

    #[error("Threat '{threat}' decays by '{value}', expected 'linear' or 'exponential'")]
    UnknownDecay { threat: String, value: String },

    #[error("No raster provided for threat '{0}'")]
    MissingThreatRaster(String),

    #[error("Landcover code {code} appears in the raster but not in the sensitivity table")]
    UnmappedLandcover { code: i64 },
}

/// Errors from the native geoprocessing backend.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode raster '{path}':\n{message}")]
    Decode { path: Utf8PathBuf, message: String },

    #[error("Couldn't encode raster '{path}':\n{message}")]
    Encode { path: Utf8PathBuf, message: String },

    #[error("Couldn't parse vector '{path}':\n{source}")]
    Vector {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Raster shape mismatch: {0}x{1} vs {2}x{3}")]
    ShapeMismatch(usize, usize, usize, usize),

    #[error("Landcover code {code} has no entry in the reclassification map")]
    UnmappedCode { code: i64 },

    #[error("Raster calculator invoked with no input bands")]
    EmptyBandList,
}

/// Errors raised by the task graph itself, as opposed to errors raised inside
/// a task's callable (those travel as [`TaskError::Execution`]).
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Task graph is closed, no further tasks may be added")]
    Closed,

    #[error("Output '{0}' is already owned by another task")]
    DuplicateTarget(Utf8PathBuf),

    #[error("Task registered without target outputs")]
    EmptyTargets,

    #[error("No registered task produces '{0}'")]
    UnknownTarget(Utf8PathBuf),

    #[error("Task '{label}' failed:\n{source}\nunproduced outputs: {}", downstream.join(", "))]
    Execution {
        label: String,
        #[source]
        source: Arc<anyhow::Error>,
        /// Every artifact that could not be produced as a result, including
        /// the failed task's own outputs.
        downstream: Vec<String>,
    },

    #[error("Couldn't create token directory '{path}':\n{message}")]
    TokenDir { path: Utf8PathBuf, message: String },
}

/// Top-level error for a model run.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid model configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Model run failed:\n{0}")]
    Task(#[from] TaskError),

    #[error("Geoprocessing error:\n{0}")]
    Geo(#[from] GeoError),

    #[error("Workspace error:\n{0}")]
    Workspace(#[from] std::io::Error),
}
