//! Data models for labsweep: axes, dataset descriptors, generated data and run metadata.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use ndarray::{ArrayD, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::{LabsweepError, Result};

/// One named, ordered coordinate of a dataset or sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    name: String,
    range: Vec<f64>,
    unit: String,
}

impl Axis {
    /// Create an axis. The range must be non-empty and every value finite.
    pub fn new(name: impl Into<String>, range: Vec<f64>, unit: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if range.is_empty() {
            return Err(LabsweepError::InvalidAxis {
                name,
                reason: "range is empty".to_string(),
            });
        }
        if let Some(bad) = range.iter().find(|v| !v.is_finite()) {
            return Err(LabsweepError::InvalidAxis {
                name,
                reason: format!("range contains non-finite value {bad}"),
            });
        }
        Ok(Self {
            name,
            range,
            unit: unit.into(),
        })
    }

    /// `n` evenly spaced points from `start` to `stop`, both inclusive.
    pub fn linspace(
        name: impl Into<String>,
        start: f64,
        stop: f64,
        n: usize,
        unit: impl Into<String>,
    ) -> Result<Self> {
        let range = match n {
            0 => vec![],
            1 => vec![start],
            _ => {
                let step = (stop - start) / (n - 1) as f64;
                (0..n).map(|i| start + step * i as f64).collect()
            }
        };
        Self::new(name, range, unit)
    }

    /// Values from `start` towards `stop` (exclusive) in increments of `step`.
    pub fn arange(
        name: impl Into<String>,
        start: f64,
        stop: f64,
        step: f64,
        unit: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if step == 0.0 || !step.is_finite() {
            return Err(LabsweepError::InvalidAxis {
                name,
                reason: format!("invalid step {step}"),
            });
        }
        let count = ((stop - start) / step).ceil();
        let count = if count.is_finite() && count > 0.0 { count as usize } else { 0 };
        let range = (0..count).map(|i| start + step * i as f64).collect();
        Self::new(name, range, unit)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> &[f64] {
        &self.range
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let low = self.range.iter().copied().fold(f64::INFINITY, f64::min);
        let high = self.range.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        write!(
            f,
            "{}=({} {} to {} {} in {} steps)",
            self.name,
            low,
            self.unit,
            high,
            self.unit,
            self.len()
        )
    }
}

/// Where a dataset is sorted into inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Data,
    Analysis,
    View,
}

impl Category {
    /// Group name below `/entry`.
    pub fn group(&self) -> &'static str {
        match self {
            Category::Data => "data0",
            Category::Analysis => "analysis0",
            Category::View => "view0",
        }
    }

    /// Absolute path of a dataset called `name` in this category.
    pub fn path_of(&self, name: &str) -> String {
        format!("/entry/{}/{}", self.group(), name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Data => write!(f, "data"),
            Category::Analysis => write!(f, "analysis"),
            Category::View => write!(f, "view"),
        }
    }
}

/// Declared name, axes, unit and category of one dataset, independent of its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDescriptor {
    pub name: String,
    pub axes: Vec<Axis>,
    pub unit: String,
    pub category: Category,
}

impl DataDescriptor {
    pub fn new(name: impl Into<String>, axes: Vec<Axis>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            axes,
            unit: unit.into(),
            category: Category::Data,
        }
    }

    /// A zero-dimensional descriptor.
    pub fn scalar(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::new(name, vec![], unit)
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(Axis::len).collect()
    }

    /// Attach data, failing with `ShapeMismatch` unless its shape equals [`Self::shape`].
    pub fn with_data<D: Dimension>(&self, data: ndarray::Array<f64, D>) -> Result<GeneratedData> {
        GeneratedData::new(self.clone(), data.into_dyn())
    }

    pub fn with_value(&self, value: f64) -> Result<GeneratedData> {
        self.with_data(ndarray::arr0(value))
    }

    /// Wrap a flat vector. Only valid for one-dimensional descriptors.
    pub fn with_vec(&self, values: Vec<f64>) -> Result<GeneratedData> {
        self.with_data(ndarray::Array1::from(values))
    }
}

/// Reject schemas that declare the same name twice within a category.
pub fn validate_schema(schema: &[DataDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();
    for descriptor in schema {
        if !seen.insert((descriptor.category, descriptor.name.as_str())) {
            return Err(LabsweepError::NameConflict {
                path: descriptor.category.path_of(&descriptor.name),
                reason: "declared twice in one schema".to_string(),
            });
        }
    }
    Ok(())
}

/// Concrete data for one descriptor. The shape always matches the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedData {
    descriptor: DataDescriptor,
    data: ArrayD<f64>,
}

impl GeneratedData {
    pub fn new(descriptor: DataDescriptor, data: ArrayD<f64>) -> Result<Self> {
        let expected = descriptor.shape();
        if data.shape() != expected.as_slice() {
            return Err(LabsweepError::ShapeMismatch {
                name: descriptor.name,
                expected,
                found: data.shape().to_vec(),
            });
        }
        Ok(Self { descriptor, data })
    }

    pub fn descriptor(&self) -> &DataDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    /// Rebind the same values to another descriptor of identical shape.
    pub fn relabel(&self, descriptor: DataDescriptor) -> Result<Self> {
        Self::new(descriptor, self.data.clone())
    }
}

/// Element type of a stored dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float64,
    Int64,
    Text,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::Float64 => "float64",
            DType::Int64 => "int64",
            DType::Text => "text",
        }
    }
}

/// A single value stored in a dataset cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Float(f64),
    Int(i64),
    Text(String),
}

impl CellValue {
    pub fn dtype(&self) -> DType {
        match self {
            CellValue::Float(_) => DType::Float64,
            CellValue::Int(_) => DType::Int64,
            CellValue::Text(_) => DType::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Float(f) => Some(*f),
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Text(_) => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}
impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}
impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}
impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

/// Whether a cell has been measured. Floats use NaN for `Empty` on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum CellState {
    Empty,
    Written(CellValue),
}

impl CellState {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellState::Empty)
    }

    pub fn value(&self) -> Option<&CellValue> {
        match self {
            CellState::Empty => None,
            CellState::Written(v) => Some(v),
        }
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Metadata stored alongside a run as `run.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub name: String,
    pub uuid: String,
    pub file: String,
    pub status: RunStatus,
    pub dimensionality: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Error message of a failed run.
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn axis(name: &str, n: usize) -> Axis {
        Axis::linspace(name, 0.0, 1.0, n, "V").unwrap()
    }

    #[test]
    fn test_axis_rejects_empty_and_non_finite() {
        assert!(matches!(
            Axis::new("x", vec![], "V"),
            Err(LabsweepError::InvalidAxis { .. })
        ));
        assert!(matches!(
            Axis::new("x", vec![0.0, f64::NAN], "V"),
            Err(LabsweepError::InvalidAxis { .. })
        ));
    }

    #[test]
    fn test_arange_excludes_stop() {
        let ax = Axis::arange("b", 0.0, 1.0, 0.25, "A").unwrap();
        assert_eq!(ax.range(), &[0.0, 0.25, 0.5, 0.75]);
        let down = Axis::arange("b", 1.0, 0.0, -0.5, "A").unwrap();
        assert_eq!(down.range(), &[1.0, 0.5]);
    }

    #[test]
    fn test_descriptor_shape_outer_to_inner() {
        let d = DataDescriptor::new("amp", vec![axis("f", 5), axis("p", 3)], "V");
        assert_eq!(d.shape(), vec![5, 3]);
        assert!(DataDescriptor::scalar("t", "K").shape().is_empty());
    }

    #[test]
    fn test_with_data_validates_shape() {
        let d = DataDescriptor::new("trace", vec![axis("f", 3)], "V");
        assert!(d.with_data(array![1.0, 2.0, 3.0]).is_ok());
        let err = d.with_data(array![1.0, 2.0]).unwrap_err();
        match err {
            LabsweepError::ShapeMismatch { expected, found, .. } => {
                assert_eq!(expected, vec![3]);
                assert_eq!(found, vec![2]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // A scalar value does not fit a vector descriptor.
        assert!(d.with_value(1.0).is_err());
    }

    #[test]
    fn test_validate_schema_rejects_duplicate_names() {
        let a = DataDescriptor::scalar("x", "V");
        let b = DataDescriptor::new("x", vec![axis("f", 2)], "V");
        assert!(validate_schema(&[a.clone(), b]).is_err());
        let c = a.clone().with_category(Category::Analysis);
        assert!(validate_schema(&[a, c]).is_ok());
    }

    #[test]
    fn test_category_paths() {
        assert_eq!(Category::Data.path_of("v_0"), "/entry/data0/v_0");
        assert_eq!(Category::Analysis.path_of("r"), "/entry/analysis0/r");
        assert_eq!(Category::View.path_of("IV"), "/entry/view0/IV");
    }
}
