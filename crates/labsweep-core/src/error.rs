//! Error types for labsweep-core.

use thiserror::Error;

/// Failures of the storage layer. All of them are fatal for the current run.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("File was opened read-only: {0}")]
    ReadOnly(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Dataset {0} was not created as resizable")]
    NotResizable(String),

    #[error("Index {index:?} is out of bounds for {path} with shape {shape:?}")]
    OutOfBounds {
        path: String,
        index: Vec<usize>,
        shape: Vec<usize>,
    },

    #[error("Dataset {path} stores {expected} values, got {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Run folder already exists: {0}")]
    RunExists(String),

    #[error("Corrupt journal: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum LabsweepError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Shape mismatch for {name}: descriptor expects {expected:?}, data has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Dataset {path} already exists with a different structure: {reason}")]
    NameConflict { path: String, reason: String },

    #[error("Refusing to overwrite measured data in {path} at {index:?}")]
    Overwrite { path: String, index: Vec<usize> },

    #[error("Measurement output does not match its declared structure: {0}")]
    SchemaMismatch(String),

    #[error("Invalid axis {name}: {reason}")]
    InvalidAxis { name: String, reason: String },

    #[error("View {view} references missing dataset {path}")]
    UnresolvedView { view: String, path: String },

    #[error("Can not decode run identifier {0:?}")]
    InvalidIdentifier(String),

    /// Raised by a getter, setter or adapter; carried unchanged.
    #[error(transparent)]
    Instrument(#[from] anyhow::Error),
}

impl From<std::io::Error> for LabsweepError {
    fn from(e: std::io::Error) -> Self {
        LabsweepError::Storage(StorageError::Io(e))
    }
}

impl From<serde_json::Error> for LabsweepError {
    fn from(e: serde_json::Error) -> Self {
        LabsweepError::Storage(StorageError::Json(e))
    }
}

impl From<serde_yaml::Error> for LabsweepError {
    fn from(e: serde_yaml::Error) -> Self {
        LabsweepError::Storage(StorageError::Yaml(e))
    }
}

impl From<arrow::error::ArrowError> for LabsweepError {
    fn from(e: arrow::error::ArrowError) -> Self {
        LabsweepError::Storage(StorageError::Arrow(e))
    }
}

impl From<parquet::errors::ParquetError> for LabsweepError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        LabsweepError::Storage(StorageError::Parquet(e))
    }
}

pub type Result<T> = std::result::Result<T, LabsweepError>;
