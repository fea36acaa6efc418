//! labsweep-core: sweep engine and crash-safe storage for lab measurements.
//!
//! Measurements declare their datasets before any hardware is touched, the
//! whole file layout is created up front, and every sweep point is durable
//! before the next one starts. Empty cells are NaN (or null for integer and
//! text datasets), so a file always shows exactly which points were measured.

pub mod adapter;
pub mod config;
pub mod error;
pub mod export;
mod journal;
pub mod logging;
pub mod models;
pub mod naming;
pub mod storage;
pub mod sweep;
pub mod views;

pub use ndarray;

pub use adapter::{
    complex_descriptors, expand_complex, AnalysisAdapter, ComplexMeasurement, FnMeasurement,
    MapAnalysis, Measurement, MeasurementAdapter, NameMatcher, PairRatio, ScalarMeasurement,
    Unmatched,
};
pub use config::{DataConfig, FolderStructure};
pub use error::{LabsweepError, Result, StorageError};
pub use export::DatasetTable;
pub use models::{
    Axis, Category, CellState, CellValue, DType, DataDescriptor, GeneratedData, RunMetadata,
    RunStatus,
};
pub use naming::{decode_uuid, encode_uuid, RunPath};
pub use storage::{DataFile, DatasetHandle, DatasetHeader, DatasetSpec, Mode};
pub use sweep::{Experiment, NoProgress, ProgressObserver, Sweep, SweepState};
pub use views::{AnalysisType, DataReference, DataView, ViewType};
