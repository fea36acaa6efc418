//! Storage layer: one self-describing container file per run.
//!
//! Datasets live at hierarchical paths (`/entry/data0/<name>`,
//! `/entry/analysis0/<name>`, `/entry/view0/<name>`) and are mirrored in
//! memory. Every mutation is appended to the journal and synced before the
//! call returns, so a crash never loses a completed write.
//!
//! Float cells are created as NaN and a NaN cell means "not yet measured".
//! Integer and text cells use an explicit empty state instead.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LabsweepError, Result, StorageError};
use crate::journal::{self, JournalWriter, Record, Values};
use crate::models::{Axis, Category, CellState, CellValue, DType, RunMetadata};
use crate::views::DataView;

/// How to open a container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read only. Tolerates a file that is still being written.
    Read,
    /// Create or truncate.
    Write,
    /// Open or create, keeping existing datasets.
    Append,
}

/// Persisted description of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHeader {
    pub name: String,
    pub category: Category,
    pub shape: Vec<usize>,
    /// Paths of the linked axis datasets, outermost first.
    pub axes: Vec<String>,
    pub unit: String,
    pub dtype: DType,
    pub resizable: bool,
    /// Set for datasets holding the values of an [`Axis`].
    pub coordinate: bool,
    pub comment: Option<String>,
}

impl DatasetHeader {
    pub fn path(&self) -> String {
        self.category.path_of(&self.name)
    }

    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    /// Number of cells, or `None` when the shape overflows `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        cell_count(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn same_structure(&self, other: &DatasetHeader) -> std::result::Result<(), String> {
        if self.shape != other.shape {
            return Err(format!("shape {:?} != {:?}", self.shape, other.shape));
        }
        if self.axes != other.axes {
            return Err(format!("axes {:?} != {:?}", self.axes, other.axes));
        }
        if self.dtype != other.dtype {
            return Err(format!("dtype {} != {}", self.dtype.name(), other.dtype.name()));
        }
        if self.resizable != other.resizable {
            return Err(format!("resizable {} != {}", self.resizable, other.resizable));
        }
        Ok(())
    }
}

/// Requested structure for [`DataFile::create_dataset`].
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    name: String,
    shape: Vec<usize>,
    axes: Vec<DatasetHandle>,
    unit: String,
    category: Category,
    dtype: DType,
    resizable: bool,
    comment: Option<String>,
}

impl DatasetSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            axes: vec![],
            unit: "a.u.".to_string(),
            category: Category::Data,
            dtype: DType::Float64,
            resizable: false,
            comment: None,
        }
    }

    pub fn axes(mut self, axes: Vec<DatasetHandle>) -> Self {
        self.axes = axes;
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Allow growing the outermost dimension with [`DataFile::resize`].
    pub fn resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Lightweight, clonable address of a dataset in a [`DataFile`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetHandle {
    name: String,
    category: Category,
}

impl DatasetHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn path(&self) -> String {
        self.category.path_of(&self.name)
    }
}

impl fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// A view whose references all exist.
#[derive(Debug, Clone)]
pub struct ResolvedView {
    pub x: DatasetHandle,
    pub y: DatasetHandle,
    pub z: Option<DatasetHandle>,
}

#[derive(Debug, Clone)]
struct StoredDataset {
    header: DatasetHeader,
    values: Values,
}

#[derive(Debug, Clone)]
struct TextEntry {
    text: String,
    comment: Option<String>,
}

impl Values {
    fn empty(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Float64 => Values::Float(vec![f64::NAN; len]),
            DType::Int64 => Values::Int(vec![None; len]),
            DType::Text => Values::Text(vec![None; len]),
        }
    }

    fn state(&self, i: usize) -> CellState {
        match self {
            Values::Float(v) if v[i].is_nan() => CellState::Empty,
            Values::Float(v) => CellState::Written(CellValue::Float(v[i])),
            Values::Int(v) => v[i].map_or(CellState::Empty, |x| CellState::Written(CellValue::Int(x))),
            Values::Text(v) => v[i]
                .clone()
                .map_or(CellState::Empty, |s| CellState::Written(CellValue::Text(s))),
        }
    }

    fn is_filled(&self, i: usize) -> bool {
        match self {
            Values::Float(v) => !v[i].is_nan(),
            Values::Int(v) => v[i].is_some(),
            Values::Text(v) => v[i].is_some(),
        }
    }

    fn filled_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_filled(i)).count()
    }

    /// Overwrite `offset..offset + other.len()`. Types must agree.
    fn splice(&mut self, offset: usize, other: &Values) -> std::result::Result<(), String> {
        if offset.checked_add(other.len()).map_or(true, |end| end > self.len()) {
            return Err(format!(
                "write of {} cells at {offset} exceeds {} cells",
                other.len(),
                self.len()
            ));
        }
        match (self, other) {
            (Values::Float(dst), Values::Float(src)) => {
                dst[offset..offset + src.len()].copy_from_slice(src)
            }
            (Values::Int(dst), Values::Int(src)) => {
                dst[offset..offset + src.len()].copy_from_slice(src)
            }
            (Values::Text(dst), Values::Text(src)) => {
                dst[offset..offset + src.len()].clone_from_slice(src)
            }
            (dst, src) => {
                return Err(format!("can not write {} into {}", src.type_name(), dst.type_name()))
            }
        }
        Ok(())
    }

    fn grow(&mut self, len: usize) {
        match self {
            Values::Float(v) => v.resize(len, f64::NAN),
            Values::Int(v) => v.resize(len, None),
            Values::Text(v) => v.resize(len, None),
        }
    }
}

fn single_value(value: CellValue) -> Values {
    match value {
        CellValue::Float(f) => Values::Float(vec![f]),
        CellValue::Int(i) => Values::Int(vec![Some(i)]),
        CellValue::Text(s) => Values::Text(vec![Some(s)]),
    }
}

fn cell_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &n| acc.checked_mul(n))
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}

/// Flat C-order offset of `prefix` plus the number of cells it addresses.
fn block_range(path: &str, shape: &[usize], prefix: &[usize]) -> Result<(usize, usize)> {
    if prefix.len() > shape.len() || prefix.iter().zip(shape).any(|(i, n)| i >= n) {
        return Err(StorageError::OutOfBounds {
            path: path.to_string(),
            index: prefix.to_vec(),
            shape: shape.to_vec(),
        }
        .into());
    }
    let strides = strides(shape);
    let offset = prefix.iter().zip(&strides).map(|(i, s)| i * s).sum();
    let len = shape[prefix.len()..].iter().product();
    Ok((offset, len))
}

/// One container file, mirrored in memory.
pub struct DataFile {
    path: PathBuf,
    mode: Mode,
    datasets: IndexMap<String, StoredDataset>,
    texts: IndexMap<String, TextEntry>,
    views: IndexMap<String, DataView>,
    attributes: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    journal: Option<JournalWriter>,
}

impl fmt::Debug for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFile")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("datasets", &self.datasets.len())
            .finish()
    }
}

impl DataFile {
    /// Open a container file.
    ///
    /// `Write` truncates. `Append` replays the existing journal and compacts
    /// it, dropping a torn tail left by a crash. `Read` never touches the file.
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = Self {
            path: path.clone(),
            mode,
            datasets: IndexMap::new(),
            texts: IndexMap::new(),
            views: IndexMap::new(),
            attributes: BTreeMap::new(),
            journal: None,
        };

        match mode {
            Mode::Write => {
                file.journal = Some(JournalWriter::create(&path)?);
                file.set_attribute("/", "labsweep_version", env!("CARGO_PKG_VERSION"))?;
                info!(path = %path.display(), "Created data file");
            }
            Mode::Append => {
                if path.exists() {
                    let replay = journal::read_journal(&path)?;
                    for record in replay.records {
                        file.apply(record)?;
                    }
                    file.journal = Some(JournalWriter::compact(&path, &file.snapshot())?);
                    if replay.torn {
                        warn!(path = %path.display(), "Recovered data file with a torn tail");
                    }
                    info!(path = %path.display(), datasets = file.datasets.len(), "Reopened data file");
                } else {
                    file.journal = Some(JournalWriter::create(&path)?);
                    file.set_attribute("/", "labsweep_version", env!("CARGO_PKG_VERSION"))?;
                    info!(path = %path.display(), "Created data file");
                }
            }
            Mode::Read => {
                if !path.exists() {
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} does not exist", path.display()),
                    ))
                    .into());
                }
                let replay = journal::read_journal(&path)?;
                for record in replay.records {
                    file.apply(record)?;
                }
                debug!(path = %path.display(), datasets = file.datasets.len(), "Opened data file read-only");
            }
        }
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    // ─── Structure ───────────────────────────────────────────────────────────

    /// Create a dataset with every cell empty.
    ///
    /// Creating an identical dataset again is a no-op. A differing shape,
    /// axis linkage, element type or resizability under the same name is a
    /// `NameConflict`; unit and comment are not compared.
    pub fn create_dataset(&mut self, spec: DatasetSpec) -> Result<DatasetHandle> {
        let axes = spec
            .axes
            .iter()
            .map(|h| {
                self.header(h)
                    .map(|header| (h.path(), header.len()))
            })
            .collect::<Result<Vec<_>>>()?;
        if !axes.is_empty() {
            let lengths: Vec<usize> = axes.iter().map(|(_, n)| *n).collect();
            let fixed = |k: usize| !(spec.resizable && k == 0);
            if lengths.len() != spec.shape.len()
                || lengths
                    .iter()
                    .zip(&spec.shape)
                    .enumerate()
                    .any(|(k, (a, s))| fixed(k) && a != s)
            {
                return Err(LabsweepError::ShapeMismatch {
                    name: spec.name,
                    expected: spec.shape,
                    found: lengths,
                });
            }
        }

        let header = DatasetHeader {
            name: spec.name,
            category: spec.category,
            shape: spec.shape,
            axes: axes.into_iter().map(|(p, _)| p).collect(),
            unit: spec.unit,
            dtype: spec.dtype,
            resizable: spec.resizable,
            coordinate: false,
            comment: spec.comment,
        };
        self.create_from_header(header)
    }

    fn create_from_header(&mut self, header: DatasetHeader) -> Result<DatasetHandle> {
        let path = header.path();
        let handle = DatasetHandle {
            name: header.name.clone(),
            category: header.category,
        };
        if let Some(existing) = self.datasets.get(&path) {
            return match existing.header.same_structure(&header) {
                Ok(()) => {
                    debug!(%path, "Dataset already exists");
                    Ok(handle)
                }
                Err(reason) => Err(LabsweepError::NameConflict { path, reason }),
            };
        }
        if self.texts.contains_key(&path) {
            return Err(LabsweepError::NameConflict {
                path,
                reason: "name is used by a text record".to_string(),
            });
        }
        if header.checked_len().is_none() {
            return Err(StorageError::OutOfBounds {
                path,
                index: vec![],
                shape: header.shape,
            }
            .into());
        }
        self.commit(vec![Record::CreateDataset { path: path.clone(), header }])?;
        debug!(%path, "Created dataset");
        Ok(handle)
    }

    /// Get or create the coordinate dataset holding `axis`'s values.
    ///
    /// An existing axis dataset with different values is a `NameConflict`.
    pub fn create_axis(&mut self, axis: &Axis) -> Result<DatasetHandle> {
        let path = Category::Data.path_of(axis.name());
        if let Some(existing) = self.datasets.get(&path) {
            let same = existing.header.coordinate
                && matches!(&existing.values, Values::Float(v) if v.as_slice() == axis.range());
            if !same {
                return Err(LabsweepError::NameConflict {
                    path,
                    reason: "axis values differ from the existing dataset".to_string(),
                });
            }
            return Ok(DatasetHandle {
                name: axis.name().to_string(),
                category: Category::Data,
            });
        }

        let header = DatasetHeader {
            name: axis.name().to_string(),
            category: Category::Data,
            shape: vec![axis.len()],
            axes: vec![],
            unit: axis.unit().to_string(),
            dtype: DType::Float64,
            resizable: false,
            coordinate: true,
            comment: None,
        };
        self.ensure_writable()?;
        self.commit(vec![
            Record::CreateDataset { path: path.clone(), header },
            Record::WriteCells {
                path,
                offset: 0,
                values: Values::Float(axis.range().to_vec()),
            },
        ])?;
        Ok(DatasetHandle {
            name: axis.name().to_string(),
            category: Category::Data,
        })
    }

    /// Look a dataset up. Never fails; absent datasets give `None`.
    pub fn get_dataset(&self, name: &str, category: Category) -> Option<DatasetHandle> {
        self.datasets
            .contains_key(&category.path_of(name))
            .then(|| DatasetHandle {
                name: name.to_string(),
                category,
            })
    }

    /// Look a dataset up by its full path, e.g. `/entry/data0/x`.
    pub fn dataset_at(&self, path: &str) -> Option<DatasetHandle> {
        self.datasets.get(path).map(|stored| DatasetHandle {
            name: stored.header.name.clone(),
            category: stored.header.category,
        })
    }

    pub fn header(&self, handle: &DatasetHandle) -> Result<&DatasetHeader> {
        Ok(&self.stored(handle)?.header)
    }

    pub fn datasets(&self) -> impl Iterator<Item = &DatasetHeader> {
        self.datasets.values().map(|d| &d.header)
    }

    /// Grow the outermost dimension of a resizable dataset. New cells are empty.
    pub fn resize(&mut self, handle: &DatasetHandle, new_len: usize) -> Result<()> {
        self.ensure_writable()?;
        let header = self.header(handle)?;
        let path = handle.path();
        if !header.resizable || header.shape.is_empty() {
            return Err(StorageError::NotResizable(path).into());
        }
        if new_len < header.shape[0] {
            return Err(StorageError::OutOfBounds {
                path,
                index: vec![new_len],
                shape: header.shape.clone(),
            }
            .into());
        }
        let mut shape = header.shape.clone();
        shape[0] = new_len;
        if cell_count(&shape).is_none() {
            return Err(StorageError::OutOfBounds {
                path,
                index: vec![new_len],
                shape,
            }
            .into());
        }
        self.commit(vec![Record::Resize { path, shape }])
    }

    // ─── Cells ───────────────────────────────────────────────────────────────

    /// State of the cell at `index` (which must address a single cell).
    pub fn cell(&self, handle: &DatasetHandle, index: &[usize]) -> Result<CellState> {
        let stored = self.stored(handle)?;
        let (offset, len) = self.cell_range(stored, index)?;
        debug_assert_eq!(len, 1);
        Ok(stored.values.state(offset))
    }

    /// Write one cell. The cell must be empty; its previous value is never replaced.
    pub fn write_cell(
        &mut self,
        handle: &DatasetHandle,
        index: &[usize],
        value: impl Into<CellValue>,
    ) -> Result<()> {
        self.ensure_writable()?;
        let value = value.into();
        let stored = self.stored(handle)?;
        let path = handle.path();
        if value.dtype() != stored.header.dtype {
            return Err(StorageError::TypeMismatch {
                path,
                expected: stored.header.dtype.name(),
                found: value.dtype().name(),
            }
            .into());
        }
        let (offset, _) = self.cell_range(stored, index)?;
        if stored.values.is_filled(offset) {
            return Err(LabsweepError::Overwrite {
                path,
                index: index.to_vec(),
            });
        }
        self.commit(vec![Record::WriteCells {
            path,
            offset: offset as u64,
            values: single_value(value),
        }])
    }

    /// Write the block of a float dataset addressed by `prefix`.
    ///
    /// `data` must have the shape of the remaining inner dimensions and every
    /// cell in the block must still be empty.
    pub fn write_block(
        &mut self,
        handle: &DatasetHandle,
        prefix: &[usize],
        data: &ArrayD<f64>,
    ) -> Result<()> {
        self.ensure_writable()?;
        let stored = self.stored(handle)?;
        let path = handle.path();
        let shape = &stored.header.shape;
        let (offset, len) = block_range(&path, shape, prefix)?;
        let inner = &shape[prefix.len()..];
        if data.shape() != inner {
            return Err(LabsweepError::ShapeMismatch {
                name: stored.header.name.clone(),
                expected: inner.to_vec(),
                found: data.shape().to_vec(),
            });
        }
        if !matches!(stored.values, Values::Float(_)) {
            return Err(StorageError::TypeMismatch {
                path,
                expected: stored.header.dtype.name(),
                found: "float64",
            }
            .into());
        }
        if (offset..offset + len).any(|i| stored.values.is_filled(i)) {
            return Err(LabsweepError::Overwrite {
                path,
                index: prefix.to_vec(),
            });
        }
        // Standard layout iteration order is C order.
        let values: Vec<f64> = data.iter().copied().collect();
        self.commit(vec![Record::WriteCells {
            path,
            offset: offset as u64,
            values: Values::Float(values),
        }])
    }

    /// True when no cell of the block at `prefix` has been written.
    pub fn block_is_empty(&self, handle: &DatasetHandle, prefix: &[usize]) -> Result<bool> {
        let stored = self.stored(handle)?;
        let (offset, len) = block_range(&handle.path(), &stored.header.shape, prefix)?;
        Ok((offset..offset + len).all(|i| !stored.values.is_filled(i)))
    }

    /// Whole dataset as floats; empty cells read as NaN.
    pub fn read_array(&self, handle: &DatasetHandle) -> Result<ArrayD<f64>> {
        self.read_block(handle, &[])
    }

    /// Block at `prefix` as floats; empty cells read as NaN.
    pub fn read_block(&self, handle: &DatasetHandle, prefix: &[usize]) -> Result<ArrayD<f64>> {
        let stored = self.stored(handle)?;
        let path = handle.path();
        let shape = &stored.header.shape;
        let (offset, len) = block_range(&path, shape, prefix)?;
        let values: Vec<f64> = match &stored.values {
            Values::Float(v) => v[offset..offset + len].to_vec(),
            Values::Int(v) => v[offset..offset + len]
                .iter()
                .map(|x| x.map_or(f64::NAN, |x| x as f64))
                .collect(),
            Values::Text(_) => {
                return Err(StorageError::TypeMismatch {
                    path,
                    expected: "text",
                    found: "float64",
                }
                .into())
            }
        };
        ArrayD::from_shape_vec(IxDyn(&shape[prefix.len()..]), values)
            .map_err(|e| StorageError::Corrupt(e.to_string()).into())
    }

    /// Every cell state of the dataset in C order.
    pub fn cells(&self, handle: &DatasetHandle) -> Result<Vec<CellState>> {
        let stored = self.stored(handle)?;
        Ok((0..stored.values.len()).map(|i| stored.values.state(i)).collect())
    }

    /// Number of written cells and total cells.
    pub fn fill_count(&self, handle: &DatasetHandle) -> Result<(usize, usize)> {
        let stored = self.stored(handle)?;
        Ok((stored.values.filled_count(), stored.values.len()))
    }

    /// Share of written cells in `[0, 1]`. An empty dataset counts as complete.
    pub fn fill_fraction(&self, handle: &DatasetHandle) -> Result<f64> {
        let (filled, total) = self.fill_count(handle)?;
        Ok(if total == 0 {
            1.0
        } else {
            filled as f64 / total as f64
        })
    }

    // ─── Text records, attributes, views ─────────────────────────────────────

    /// Store an opaque UTF-8 blob under `name` in the data group.
    pub fn write_text_record(&mut self, name: &str, text: &str, comment: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        let path = Category::Data.path_of(name);
        if self.datasets.contains_key(&path) {
            return Err(LabsweepError::NameConflict {
                path,
                reason: "name is used by a dataset".to_string(),
            });
        }
        self.commit(vec![Record::TextRecord {
            path,
            text: text.to_string(),
            comment: comment.map(str::to_string),
        }])
    }

    pub fn read_text_record(&self, name: &str) -> Option<&str> {
        self.texts
            .get(&Category::Data.path_of(name))
            .map(|t| t.text.as_str())
    }

    pub fn text_records(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.texts
            .iter()
            .map(|(path, t)| (path.as_str(), t.comment.as_deref()))
    }

    /// Set a user attribute on `path` (`/` for the file itself).
    pub fn set_attribute(
        &mut self,
        path: &str,
        key: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.commit(vec![Record::SetAttribute {
            path: path.to_string(),
            key: key.to_string(),
            value: value.into(),
        }])
    }

    /// Structural and user attributes of the object at `path`.
    pub fn attributes(&self, path: &str) -> BTreeMap<String, serde_json::Value> {
        use serde_json::json;

        let mut attrs = BTreeMap::new();
        if let Some(stored) = self.datasets.get(path) {
            let h = &stored.header;
            let ds_type = if h.coordinate {
                "coordinate".to_string()
            } else {
                h.category.to_string()
            };
            attrs.insert("ds_type".to_string(), json!(ds_type));
            attrs.insert("ds_url".to_string(), json!(path));
            attrs.insert("unit".to_string(), json!(h.unit));
            attrs.insert("dtype".to_string(), json!(h.dtype.name()));
            if let Some(comment) = &h.comment {
                attrs.insert("comment".to_string(), json!(comment));
            }
            for (i, axis) in h.axes.iter().enumerate() {
                let label = match i {
                    0 => "x".to_string(),
                    1 => "y".to_string(),
                    2 => "z".to_string(),
                    n => format!("a{n}"),
                };
                attrs.insert(format!("{label}_ds_url"), json!(axis));
            }
        } else if let Some(text) = self.texts.get(path) {
            attrs.insert("ds_type".to_string(), json!("text"));
            attrs.insert("ds_url".to_string(), json!(path));
            if let Some(comment) = &text.comment {
                attrs.insert("comment".to_string(), json!(comment));
            }
        } else if let Some(view) = self.views.get(path) {
            attrs.insert("ds_type".to_string(), json!("view"));
            attrs.insert("ds_url".to_string(), json!(path));
            attrs.insert("xyz".to_string(), json!(view.xyz()));
            attrs.insert("view_type".to_string(), json!(view.view_type));
            attrs.insert("view_params".to_string(), view.params.clone());
        }
        if let Some(user) = self.attributes.get(path) {
            attrs.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        attrs
    }

    /// Register a view. An identical view under the same name is a no-op.
    pub fn insert_view(&mut self, name: &str, view: DataView) -> Result<()> {
        self.ensure_writable()?;
        let path = Category::View.path_of(name);
        if let Some(existing) = self.views.get(&path) {
            if *existing == view {
                return Ok(());
            }
            return Err(LabsweepError::NameConflict {
                path,
                reason: "a different view is registered under this name".to_string(),
            });
        }
        self.commit(vec![Record::View { path, view }])
    }

    pub fn views(&self) -> impl Iterator<Item = (&str, &DataView)> {
        self.views.iter().map(|(p, v)| (p.as_str(), v))
    }

    pub fn view(&self, name: &str) -> Option<&DataView> {
        self.views.get(&Category::View.path_of(name))
    }

    /// Resolve every reference of a view, failing on the first missing dataset.
    pub fn resolve_view(&self, name: &str) -> Result<ResolvedView> {
        let view = self
            .view(name)
            .ok_or_else(|| StorageError::DatasetNotFound(Category::View.path_of(name)))?;
        let lookup = |r: &crate::views::DataReference| {
            self.get_dataset(&r.name, r.category)
                .ok_or_else(|| LabsweepError::UnresolvedView {
                    view: name.to_string(),
                    path: r.to_path(),
                })
        };
        Ok(ResolvedView {
            x: lookup(&view.x)?,
            y: lookup(&view.y)?,
            z: view.z.as_ref().map(lookup).transpose()?,
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Sync the journal. Every write is already durable, this is a checkpoint.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.sync()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        debug!(path = %self.path.display(), "Closed data file");
        Ok(())
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn ensure_writable(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(StorageError::ReadOnly(self.path.display().to_string()).into());
        }
        Ok(())
    }

    fn stored(&self, handle: &DatasetHandle) -> Result<&StoredDataset> {
        let path = handle.path();
        self.datasets
            .get(&path)
            .ok_or_else(|| StorageError::DatasetNotFound(path).into())
    }

    fn cell_range(&self, stored: &StoredDataset, index: &[usize]) -> Result<(usize, usize)> {
        let shape = &stored.header.shape;
        if index.len() != shape.len() {
            return Err(StorageError::OutOfBounds {
                path: stored.header.path(),
                index: index.to_vec(),
                shape: shape.clone(),
            }
            .into());
        }
        block_range(&stored.header.path(), shape, index)
    }

    /// Append records to the journal, then apply them in memory.
    fn commit(&mut self, records: Vec<Record>) -> Result<()> {
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| StorageError::ReadOnly(self.path.display().to_string()))?;
        journal.append(&records)?;
        for record in records {
            self.apply(record)?;
        }
        Ok(())
    }

    fn apply(&mut self, record: Record) -> Result<()> {
        match record {
            Record::CreateDataset { path, header } => {
                let len = header
                    .checked_len()
                    .ok_or_else(|| StorageError::Corrupt(format!("{path}: shape {:?} overflows", header.shape)))?;
                let values = Values::empty(header.dtype, len);
                self.datasets.insert(path, StoredDataset { header, values });
            }
            Record::WriteCells { path, offset, values } => {
                let stored = self
                    .datasets
                    .get_mut(&path)
                    .ok_or_else(|| StorageError::Corrupt(format!("write to unknown dataset {path}")))?;
                let offset = usize::try_from(offset)
                    .map_err(|_| StorageError::Corrupt(format!("{path}: offset {offset} overflows")))?;
                stored
                    .values
                    .splice(offset, &values)
                    .map_err(|e| StorageError::Corrupt(format!("{path}: {e}")))?;
            }
            Record::TextRecord { path, text, comment } => {
                self.texts.insert(path, TextEntry { text, comment });
            }
            Record::SetAttribute { path, key, value } => {
                self.attributes.entry(path).or_default().insert(key, value);
            }
            Record::Resize { path, shape } => {
                let stored = self
                    .datasets
                    .get_mut(&path)
                    .ok_or_else(|| StorageError::Corrupt(format!("resize of unknown dataset {path}")))?;
                stored.header.shape = shape;
                let len = stored
                    .header
                    .checked_len()
                    .ok_or_else(|| StorageError::Corrupt(format!("{path}: shape {:?} overflows", stored.header.shape)))?;
                stored.values.grow(len);
            }
            Record::View { path, view } => {
                self.views.insert(path, view);
            }
        }
        Ok(())
    }

    /// Minimal record sequence reproducing the current state.
    fn snapshot(&self) -> Vec<Record> {
        let mut records = vec![];
        for (path, attrs) in self.attributes.iter().filter(|(p, _)| p.as_str() == "/") {
            for (key, value) in attrs {
                records.push(Record::SetAttribute {
                    path: path.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        for (path, stored) in &self.datasets {
            records.push(Record::CreateDataset {
                path: path.clone(),
                header: stored.header.clone(),
            });
            if stored.values.filled_count() > 0 {
                records.push(Record::WriteCells {
                    path: path.clone(),
                    offset: 0,
                    values: stored.values.clone(),
                });
            }
        }
        for (path, text) in &self.texts {
            records.push(Record::TextRecord {
                path: path.clone(),
                text: text.text.clone(),
                comment: text.comment.clone(),
            });
        }
        for (path, view) in &self.views {
            records.push(Record::View {
                path: path.clone(),
                view: view.clone(),
            });
        }
        for (path, attrs) in self.attributes.iter().filter(|(p, _)| p.as_str() != "/") {
            for (key, value) in attrs {
                records.push(Record::SetAttribute {
                    path: path.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        records
    }
}

// ─── YAML config I/O ─────────────────────────────────────────────────────────

pub fn save_yaml<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// `run.yaml` of the run folder containing `data_file`, if there is one.
pub fn load_run_metadata(data_file: &Path) -> Result<Option<RunMetadata>> {
    let path = match data_file.parent() {
        Some(folder) => folder.join("run.yaml"),
        None => return Ok(None),
    };
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_yaml::from_str(&content)?))
}
