//! Measurement and analysis adapters.
//!
//! An adapter declares the datasets it will produce before any data exists
//! (`expected_structure`), which lets the whole file layout be created up
//! front. Measurement adapters talk to instruments; analysis adapters are pure
//! functions of upstream data and can be re-run offline.

use std::fmt;

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use tracing::{debug, error};

use crate::error::{LabsweepError, Result, StorageError};
use crate::models::{validate_schema, Axis, Category, DataDescriptor, GeneratedData};
use crate::storage::{DataFile, DatasetSpec};
use crate::views::{AnalysisType, DataReference, DataView, ViewType};

/// Reads one value from an instrument.
pub type Getter = Box<dyn FnMut() -> anyhow::Result<f64>>;

/// Interface to measurement-type specific code (spectroscopy, IV curve, ...).
pub trait MeasurementAdapter {
    /// Datasets this measurement produces at every sweep point. Must not touch hardware.
    fn expected_structure(&self) -> Vec<DataDescriptor>;

    /// Views to register alongside the datasets.
    fn default_views(&self) -> IndexMap<String, DataView> {
        IndexMap::new()
    }

    /// Talk to the instrument. The result must match `expected_structure`
    /// exactly: same names, same order, same shapes.
    fn perform_measurement(&mut self) -> Result<Vec<GeneratedData>>;

    fn name(&self) -> String {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("measurement")
            .to_string()
    }
}

/// Interface to analysis code (conversions, fits, derived quantities).
pub trait AnalysisAdapter {
    /// Derive the output schema from the names and shapes of the upstream
    /// schema alone. Fails only if required upstream names are missing.
    fn expected_structure(&self, parent_schema: &[DataDescriptor]) -> Result<Vec<DataDescriptor>>;

    fn default_views(&self, _parent_schema: &[DataDescriptor]) -> Result<IndexMap<String, DataView>> {
        Ok(IndexMap::new())
    }

    /// Transform upstream data into data matching `expected_structure`.
    fn perform_analysis(&self, data: &[GeneratedData]) -> Result<Vec<GeneratedData>>;

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::Custom
    }

    fn analysis_params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Check produced data against the declared schema.
fn check_output(declared: &[DataDescriptor], produced: &[GeneratedData]) -> Result<()> {
    if declared.len() != produced.len() {
        return Err(LabsweepError::SchemaMismatch(format!(
            "declared {} datasets, produced {}",
            declared.len(),
            produced.len()
        )));
    }
    for (want, got) in declared.iter().zip(produced) {
        if want.name != got.name() {
            return Err(LabsweepError::SchemaMismatch(format!(
                "expected {} but got {}",
                want.name,
                got.name()
            )));
        }
        if want.shape() != got.descriptor().shape() {
            return Err(LabsweepError::ShapeMismatch {
                name: want.name.clone(),
                expected: want.shape(),
                found: got.descriptor().shape(),
            });
        }
    }
    Ok(())
}

fn force_category(schema: Vec<DataDescriptor>, category: Category) -> Vec<DataDescriptor> {
    schema
        .into_iter()
        .map(|d| d.with_category(category))
        .collect()
}

/// Create the dataset for `descriptor` with the swept axes prepended.
fn create_dataset_for(file: &mut DataFile, swept: &[Axis], descriptor: &DataDescriptor) -> Result<()> {
    let axes = swept
        .iter()
        .chain(&descriptor.axes)
        .map(|axis| file.create_axis(axis))
        .collect::<Result<Vec<_>>>()?;
    let shape = swept.iter().chain(&descriptor.axes).map(Axis::len).collect();
    file.create_dataset(
        DatasetSpec::new(descriptor.name.clone(), shape)
            .axes(axes)
            .unit(descriptor.unit.clone())
            .category(descriptor.category),
    )?;
    Ok(())
}

/// Write every datum into its dataset at `sweep_indices`.
///
/// The target block must still be empty: a filled cell means the file is
/// being reused or the sweep indices are wrong, and is refused.
fn store(file: &mut DataFile, data: &[GeneratedData], category: Category, sweep_indices: &[usize]) -> Result<()> {
    for datum in data {
        let handle = file
            .get_dataset(datum.name(), category)
            .ok_or_else(|| StorageError::DatasetNotFound(category.path_of(datum.name())))?;
        if !file.block_is_empty(&handle, sweep_indices)? {
            return Err(LabsweepError::Overwrite {
                path: handle.path(),
                index: sweep_indices.to_vec(),
            });
        }
        file.write_block(&handle, sweep_indices, datum.data())?;
    }
    file.flush()
}

/// A measurement adapter together with the analyses chained after it.
pub struct Measurement {
    adapter: Box<dyn MeasurementAdapter>,
    analyses: Vec<Box<dyn AnalysisAdapter>>,
}

impl Measurement {
    pub fn new(adapter: impl MeasurementAdapter + 'static) -> Self {
        Self {
            adapter: Box::new(adapter),
            analyses: vec![],
        }
    }

    /// Run `analysis` on this measurement's data after every recording.
    pub fn with_analysis(mut self, analysis: impl AnalysisAdapter + 'static) -> Self {
        self.analyses.push(Box::new(analysis));
        self
    }

    /// Raw-data schema without swept axes.
    pub fn schema(&self) -> Vec<DataDescriptor> {
        force_category(self.adapter.expected_structure(), Category::Data)
    }

    /// Every dataset this measurement and its analyses create, with the
    /// swept axes prepended. Touches neither storage nor hardware.
    pub fn structure(&self, swept: &[Axis]) -> Result<Vec<DataDescriptor>> {
        let parent = self.schema();
        validate_schema(&parent)?;
        let mut out = vec![];
        let prepend = |d: DataDescriptor| DataDescriptor {
            axes: swept.iter().chain(&d.axes).cloned().collect(),
            ..d
        };
        out.extend(parent.iter().cloned().map(prepend));
        for analysis in &self.analyses {
            let derived = force_category(analysis.expected_structure(&parent)?, Category::Analysis);
            validate_schema(&derived)?;
            out.extend(derived.into_iter().map(prepend));
        }
        Ok(out)
    }

    /// Largest number of axes of any produced descriptor. Fails when an
    /// analysis rejects the measurement's schema.
    pub fn dimensionality(&self) -> Result<usize> {
        let structure = self.structure(&[])?;
        Ok(structure.iter().map(|d| d.axes.len()).max().unwrap_or(0))
    }

    pub(crate) fn create_datasets(&self, file: &mut DataFile, swept: &[Axis]) -> Result<()> {
        let parent = self.schema();
        validate_schema(&parent)?;
        for descriptor in &parent {
            create_dataset_for(file, swept, descriptor)?;
        }
        for (name, view) in self.adapter.default_views() {
            file.insert_view(&name, view)?;
        }

        for analysis in &self.analyses {
            let derived = force_category(analysis.expected_structure(&parent)?, Category::Analysis);
            validate_schema(&derived)?;
            let analysis_type = serde_json::to_value(analysis.analysis_type())?;
            let params = serde_json::to_string(&analysis.analysis_params())?;
            for descriptor in &derived {
                create_dataset_for(file, swept, descriptor)?;
                let path = descriptor.category.path_of(&descriptor.name);
                file.set_attribute(&path, "analysis_type", analysis_type.clone())?;
                file.set_attribute(&path, "analysis_params", params.clone())?;
            }
            for (name, view) in analysis.default_views(&parent)? {
                file.insert_view(&name, view)?;
            }
        }
        Ok(())
    }

    /// Measure once and store the results (and all analyses) at `sweep_indices`.
    pub(crate) fn record(&mut self, file: &mut DataFile, sweep_indices: &[usize]) -> Result<()> {
        let parent = self.schema();
        let data = match self.adapter.perform_measurement() {
            Ok(data) => data,
            Err(e) => {
                error!(measurement = %self.adapter.name(), error = %e, "Measurement failed");
                return Err(e);
            }
        };
        check_output(&parent, &data)?;
        store(file, &data, Category::Data, sweep_indices)?;
        debug!(measurement = %self.adapter.name(), indices = ?sweep_indices, "Recorded");

        for analysis in &self.analyses {
            let declared = analysis.expected_structure(&parent)?;
            let derived = match analysis.perform_analysis(&data) {
                Ok(derived) => derived,
                Err(e) => {
                    error!(measurement = %self.adapter.name(), error = %e, "Analysis failed");
                    return Err(e);
                }
            };
            check_output(&declared, &derived)?;
            store(file, &derived, Category::Analysis, sweep_indices)?;
        }
        Ok(())
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.schema().into_iter().map(|d| d.name).collect();
        write!(f, "Measurement({}, ({}))", self.adapter.name(), names.join(", "))?;
        if !self.analyses.is_empty() {
            write!(f, " + {} analyses", self.analyses.len())?;
        }
        Ok(())
    }
}

// ─── Stock measurements ──────────────────────────────────────────────────────

/// The simplest measurement: one named value read by a getter.
pub struct ScalarMeasurement {
    descriptor: DataDescriptor,
    getter: Getter,
}

impl ScalarMeasurement {
    pub fn new(
        name: impl Into<String>,
        getter: impl FnMut() -> anyhow::Result<f64> + 'static,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            descriptor: DataDescriptor::scalar(name, unit),
            getter: Box::new(getter),
        }
    }
}

impl MeasurementAdapter for ScalarMeasurement {
    fn expected_structure(&self) -> Vec<DataDescriptor> {
        vec![self.descriptor.clone()]
    }

    fn perform_measurement(&mut self) -> Result<Vec<GeneratedData>> {
        let value = (self.getter)()?;
        Ok(vec![self.descriptor.with_value(value)?])
    }

    fn name(&self) -> String {
        self.descriptor.name.clone()
    }
}

/// A measurement defined by a fixed schema and a closure producing one array per descriptor.
pub struct FnMeasurement {
    descriptors: Vec<DataDescriptor>,
    views: IndexMap<String, DataView>,
    acquire: Box<dyn FnMut() -> anyhow::Result<Vec<ArrayD<f64>>>>,
}

impl FnMeasurement {
    pub fn new(
        descriptors: Vec<DataDescriptor>,
        acquire: impl FnMut() -> anyhow::Result<Vec<ArrayD<f64>>> + 'static,
    ) -> Self {
        Self {
            descriptors,
            views: IndexMap::new(),
            acquire: Box::new(acquire),
        }
    }

    pub fn with_view(mut self, name: impl Into<String>, view: DataView) -> Self {
        self.views.insert(name.into(), view);
        self
    }
}

impl MeasurementAdapter for FnMeasurement {
    fn expected_structure(&self) -> Vec<DataDescriptor> {
        self.descriptors.clone()
    }

    fn default_views(&self) -> IndexMap<String, DataView> {
        self.views.clone()
    }

    fn perform_measurement(&mut self) -> Result<Vec<GeneratedData>> {
        let arrays = (self.acquire)()?;
        if arrays.len() != self.descriptors.len() {
            return Err(LabsweepError::SchemaMismatch(format!(
                "declared {} datasets, produced {}",
                self.descriptors.len(),
                arrays.len()
            )));
        }
        self.descriptors
            .iter()
            .zip(arrays)
            .map(|(d, a)| GeneratedData::new(d.clone(), a))
            .collect()
    }
}

/// Descriptors for a complex quantity stored as real, imaginary, magnitude and phase.
pub fn complex_descriptors(base: &str, axes: &[Axis], unit: &str) -> [DataDescriptor; 4] {
    [
        DataDescriptor::new(format!("{base}_real"), axes.to_vec(), unit),
        DataDescriptor::new(format!("{base}_imag"), axes.to_vec(), unit),
        DataDescriptor::new(format!("{base}_mag"), axes.to_vec(), unit),
        DataDescriptor::new(format!("{base}_phase"), axes.to_vec(), "rad"),
    ]
}

/// Expand `(re, im)` samples in C order into the four [`complex_descriptors`] datasets.
pub fn expand_complex(descriptors: &[DataDescriptor; 4], samples: &[(f64, f64)]) -> Result<Vec<GeneratedData>> {
    let shape = descriptors[0].shape();
    let parts: [fn(&(f64, f64)) -> f64; 4] = [
        |s| s.0,
        |s| s.1,
        |s| s.0.hypot(s.1),
        |s| s.1.atan2(s.0),
    ];
    descriptors
        .iter()
        .zip(parts.iter())
        .map(|(d, part)| {
            let values: Vec<f64> = samples.iter().map(|s| part(s)).collect();
            let found = vec![values.len()];
            let array = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| {
                LabsweepError::ShapeMismatch {
                    name: d.name.clone(),
                    expected: shape.clone(),
                    found,
                }
            })?;
            GeneratedData::new(d.clone(), array)
        })
        .collect()
}

/// A complex-valued measurement, e.g. a VNA trace, stored as four real datasets.
pub struct ComplexMeasurement {
    descriptors: [DataDescriptor; 4],
    acquire: Box<dyn FnMut() -> anyhow::Result<Vec<(f64, f64)>>>,
}

impl ComplexMeasurement {
    pub fn new(
        base: &str,
        axes: Vec<Axis>,
        unit: &str,
        acquire: impl FnMut() -> anyhow::Result<Vec<(f64, f64)>> + 'static,
    ) -> Self {
        Self {
            descriptors: complex_descriptors(base, &axes, unit),
            acquire: Box::new(acquire),
        }
    }
}

impl MeasurementAdapter for ComplexMeasurement {
    fn expected_structure(&self) -> Vec<DataDescriptor> {
        self.descriptors.to_vec()
    }

    fn default_views(&self) -> IndexMap<String, DataView> {
        let mut views = IndexMap::new();
        let [real, imag, ..] = &self.descriptors;
        let view = DataView::new(
            DataReference::data(&real.name),
            DataReference::data(&imag.name),
            ViewType::OneD,
        )
        .with_params(serde_json::json!({"labels": ["Re", "Im"]}));
        let base = real.name.strip_suffix("_real").unwrap_or(&real.name);
        views.insert(format!("{base}_IQ"), view);
        views
    }

    fn perform_measurement(&mut self) -> Result<Vec<GeneratedData>> {
        let samples = (self.acquire)()?;
        expand_complex(&self.descriptors, &samples)
    }
}

impl From<ScalarMeasurement> for Measurement {
    fn from(m: ScalarMeasurement) -> Self {
        Measurement::new(m)
    }
}

impl From<FnMeasurement> for Measurement {
    fn from(m: FnMeasurement) -> Self {
        Measurement::new(m)
    }
}

impl From<ComplexMeasurement> for Measurement {
    fn from(m: ComplexMeasurement) -> Self {
        Measurement::new(m)
    }
}

// ─── Stock analyses ──────────────────────────────────────────────────────────

/// Selects upstream descriptors by name.
pub struct NameMatcher(Box<dyn Fn(&str) -> bool>);

impl NameMatcher {
    pub fn suffix(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self(Box::new(move |name| name.ends_with(&suffix)))
    }

    pub fn exact(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        Self(Box::new(move |name| names.iter().any(|n| n == name)))
    }

    pub fn predicate(f: impl Fn(&str) -> bool + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn matches(&self, name: &str) -> bool {
        (self.0)(name)
    }
}

/// What an analysis does with upstream descriptors its matcher rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    Drop,
    /// Copy unchanged into the analysis group.
    PassThrough,
}

/// Apply an element-wise function to every matching descriptor.
pub struct MapAnalysis {
    matcher: NameMatcher,
    unmatched: Unmatched,
    rename: Box<dyn Fn(&str) -> String>,
    unit: Option<String>,
    map: Box<dyn Fn(f64) -> f64>,
    label: String,
}

impl MapAnalysis {
    pub fn new(
        label: impl Into<String>,
        matcher: NameMatcher,
        rename: impl Fn(&str) -> String + 'static,
        map: impl Fn(f64) -> f64 + 'static,
    ) -> Self {
        Self {
            matcher,
            unmatched: Unmatched::Drop,
            rename: Box::new(rename),
            unit: None,
            map: Box::new(map),
            label: label.into(),
        }
    }

    /// Convert every `*_mag` dataset into `*_db` (20·log10).
    pub fn decibel() -> Self {
        Self::new(
            "decibel",
            NameMatcher::suffix("_mag"),
            |name| format!("{}_db", name.strip_suffix("_mag").unwrap_or(name)),
            |v| 20.0 * v.log10(),
        )
        .with_unit("dB")
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_unmatched(mut self, unmatched: Unmatched) -> Self {
        self.unmatched = unmatched;
        self
    }

    fn output_for(&self, d: &DataDescriptor) -> Option<DataDescriptor> {
        if self.matcher.matches(&d.name) {
            Some(DataDescriptor {
                name: (self.rename)(&d.name),
                axes: d.axes.clone(),
                unit: self.unit.clone().unwrap_or_else(|| d.unit.clone()),
                category: Category::Analysis,
            })
        } else {
            match self.unmatched {
                Unmatched::Drop => None,
                Unmatched::PassThrough => Some(d.clone().with_category(Category::Analysis)),
            }
        }
    }
}

impl AnalysisAdapter for MapAnalysis {
    fn expected_structure(&self, parent_schema: &[DataDescriptor]) -> Result<Vec<DataDescriptor>> {
        if !parent_schema.iter().any(|d| self.matcher.matches(&d.name)) {
            return Err(LabsweepError::SchemaMismatch(format!(
                "{} analysis matched none of {:?}",
                self.label,
                parent_schema.iter().map(|d| &d.name).collect::<Vec<_>>()
            )));
        }
        Ok(parent_schema.iter().filter_map(|d| self.output_for(d)).collect())
    }

    fn default_views(&self, parent_schema: &[DataDescriptor]) -> Result<IndexMap<String, DataView>> {
        let mut views = IndexMap::new();
        for d in parent_schema.iter().filter(|d| self.matcher.matches(&d.name)) {
            if let Some(axis) = d.axes.last() {
                let out = (self.rename)(&d.name);
                views.insert(
                    out.clone(),
                    DataView::line(DataReference::data(axis.name()), DataReference::analysis(out)),
                );
            }
        }
        Ok(views)
    }

    fn perform_analysis(&self, data: &[GeneratedData]) -> Result<Vec<GeneratedData>> {
        data.iter()
            .filter_map(|datum| {
                let out = self.output_for(datum.descriptor())?;
                Some(if self.matcher.matches(datum.name()) {
                    GeneratedData::new(out, datum.data().mapv(|v| (self.map)(v)))
                } else {
                    datum.relabel(out)
                })
            })
            .collect()
    }

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::Transform
    }

    fn analysis_params(&self) -> serde_json::Value {
        serde_json::json!({ "kind": self.label })
    }
}

/// Divide paired datasets element-wise, e.g. `r_n = v_n / i_n`.
///
/// Pairs are found by name: `<numerator><key>` with `<denominator><key>`.
/// Descriptors that are not part of a pair are dropped.
pub struct PairRatio {
    numerator: String,
    denominator: String,
    output: String,
    unit: String,
}

impl PairRatio {
    pub fn new(
        numerator: impl Into<String>,
        denominator: impl Into<String>,
        output: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            numerator: numerator.into(),
            denominator: denominator.into(),
            output: output.into(),
            unit: unit.into(),
        }
    }

    /// `r_<n> = v_<n> / i_<n>` in Ohm.
    pub fn resistance() -> Self {
        Self::new("v_", "i_", "r_", "Ohm")
    }

    /// (numerator, denominator, output name) for every pair in `schema`.
    fn pairs<'a>(&self, schema: &'a [DataDescriptor]) -> Vec<(&'a DataDescriptor, &'a DataDescriptor, String)> {
        schema
            .iter()
            .filter_map(|num| {
                let key = num.name.strip_prefix(&self.numerator)?;
                let den_name = format!("{}{key}", self.denominator);
                let den = schema.iter().find(|d| d.name == den_name)?;
                Some((num, den, format!("{}{key}", self.output)))
            })
            .collect()
    }
}

impl AnalysisAdapter for PairRatio {
    fn expected_structure(&self, parent_schema: &[DataDescriptor]) -> Result<Vec<DataDescriptor>> {
        let pairs = self.pairs(parent_schema);
        if pairs.is_empty() {
            return Err(LabsweepError::SchemaMismatch(format!(
                "no {}*/{}* pairs in upstream schema",
                self.numerator, self.denominator
            )));
        }
        pairs
            .into_iter()
            .map(|(num, den, out)| {
                if num.shape() != den.shape() {
                    return Err(LabsweepError::ShapeMismatch {
                        name: out,
                        expected: num.shape(),
                        found: den.shape(),
                    });
                }
                Ok(DataDescriptor {
                    name: out,
                    axes: num.axes.clone(),
                    unit: self.unit.clone(),
                    category: Category::Analysis,
                })
            })
            .collect()
    }

    fn default_views(&self, parent_schema: &[DataDescriptor]) -> Result<IndexMap<String, DataView>> {
        Ok(self
            .pairs(parent_schema)
            .into_iter()
            .map(|(_, den, out)| {
                let view = DataView::line(DataReference::data(&den.name), DataReference::analysis(&out));
                (format!("{out}_vs_{}", den.name), view)
            })
            .collect())
    }

    fn perform_analysis(&self, data: &[GeneratedData]) -> Result<Vec<GeneratedData>> {
        let schema: Vec<DataDescriptor> = data.iter().map(|d| d.descriptor().clone()).collect();
        let declared = self.expected_structure(&schema)?;
        self.pairs(&schema)
            .into_iter()
            .zip(declared)
            .map(|((num, den, _), out)| {
                let find = |name: &str| {
                    data.iter()
                        .find(|d| d.name() == name)
                        .ok_or_else(|| LabsweepError::SchemaMismatch(format!("missing {name}")))
                };
                let ratio = find(&num.name)?.data() / find(&den.name)?.data();
                GeneratedData::new(out, ratio)
            })
            .collect()
    }

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::Combination
    }

    fn analysis_params(&self) -> serde_json::Value {
        serde_json::json!({
            "numerator": self.numerator,
            "denominator": self.denominator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn freq() -> Axis {
        Axis::new("f", vec![1.0, 2.0, 3.0], "Hz").unwrap()
    }

    fn bias(n: usize) -> Axis {
        Axis::linspace(format!("i_b_{n}"), 0.0, 1.0, 3, "A").unwrap()
    }

    #[test]
    fn test_expand_complex_parts() {
        let ds = complex_descriptors("s21", &[Axis::new("f", vec![1.0, 2.0], "Hz").unwrap()], "V");
        let out = expand_complex(&ds, &[(3.0, 4.0), (0.0, -1.0)]).unwrap();
        let names: Vec<&str> = out.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["s21_real", "s21_imag", "s21_mag", "s21_phase"]);
        assert_eq!(out[2].data().as_slice().unwrap(), &[5.0, 1.0]);
        assert!((out[3].data()[[1]] + std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert_eq!(out[3].descriptor().unit, "rad");

        assert!(expand_complex(&ds, &[(1.0, 1.0)]).is_err());
    }

    #[test]
    fn test_decibel_schema_is_pure_and_selective() {
        let parent = complex_descriptors("s21", &[freq()], "V").to_vec();
        let analysis = MapAnalysis::decibel();
        let first = analysis.expected_structure(&parent).unwrap();
        let second = analysis.expected_structure(&parent).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "s21_db");
        assert_eq!(first[0].unit, "dB");
        assert_eq!(first[0].category, Category::Analysis);

        let passthrough = MapAnalysis::decibel().with_unmatched(Unmatched::PassThrough);
        assert_eq!(passthrough.expected_structure(&parent).unwrap().len(), 4);
    }

    #[test]
    fn test_decibel_without_matches_fails_on_names_only() {
        let parent = vec![DataDescriptor::scalar("temperature", "K")];
        assert!(matches!(
            MapAnalysis::decibel().expected_structure(&parent),
            Err(LabsweepError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_decibel_values() {
        let d = DataDescriptor::new("s21_mag", vec![freq()], "V");
        let data = vec![d.with_data(array![1.0, 10.0, 100.0]).unwrap()];
        let out = MapAnalysis::decibel().perform_analysis(&data).unwrap();
        assert_eq!(out[0].name(), "s21_db");
        assert_eq!(out[0].data().as_slice().unwrap(), &[0.0, 20.0, 40.0]);
    }

    #[test]
    fn test_decibel_strips_one_suffix() {
        let parent = vec![DataDescriptor::new("a_mag_mag", vec![freq()], "V")];
        let structure = MapAnalysis::decibel().expected_structure(&parent).unwrap();
        assert_eq!(structure[0].name, "a_mag_db");
    }

    #[test]
    fn test_pair_ratio_structure_and_values() {
        let schema = vec![
            DataDescriptor::new("i_0", vec![bias(0)], "A"),
            DataDescriptor::new("v_0", vec![bias(0)], "V"),
            DataDescriptor::new("i_1", vec![bias(1)], "A"),
            DataDescriptor::new("v_1", vec![bias(1)], "V"),
        ];
        let ratio = PairRatio::resistance();
        let structure = ratio.expected_structure(&schema).unwrap();
        let names: Vec<&str> = structure.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["r_0", "r_1"]);

        let views = ratio.default_views(&schema).unwrap();
        assert_eq!(views["r_0_vs_i_0"].xyz(), "/entry/data0/i_0:/entry/analysis0/r_0");

        let data = vec![
            schema[0].with_data(array![1.0, 2.0, 4.0]).unwrap(),
            schema[1].with_data(array![10.0, 10.0, 10.0]).unwrap(),
            schema[2].with_data(array![1.0, 1.0, 1.0]).unwrap(),
            schema[3].with_data(array![3.0, 2.0, 1.0]).unwrap(),
        ];
        let out = ratio.perform_analysis(&data).unwrap();
        assert_eq!(out[0].data().as_slice().unwrap(), &[10.0, 5.0, 2.5]);
        assert_eq!(out[1].data().as_slice().unwrap(), &[3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_pair_ratio_rejects_mismatched_shapes() {
        let schema = vec![
            DataDescriptor::new("i_0", vec![bias(0)], "A"),
            DataDescriptor::scalar("v_0", "V"),
        ];
        assert!(matches!(
            PairRatio::resistance().expected_structure(&schema),
            Err(LabsweepError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_check_output_requires_order() {
        let a = DataDescriptor::scalar("a", "V");
        let b = DataDescriptor::scalar("b", "V");
        let produced = vec![b.with_value(1.0).unwrap(), a.with_value(2.0).unwrap()];
        assert!(matches!(
            check_output(&[a, b], &produced),
            Err(LabsweepError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_structure_prepends_swept_axes() {
        let x = Axis::linspace("x", 0.0, 1.0, 4, "V").unwrap();
        let m = Measurement::new(ComplexMeasurement::new("s21", vec![freq()], "V", || Ok(vec![])))
            .with_analysis(MapAnalysis::decibel());
        let structure = m.structure(std::slice::from_ref(&x)).unwrap();
        assert_eq!(structure.len(), 5);
        assert!(structure.iter().all(|d| d.shape() == vec![4, 3]));
        assert_eq!(structure[4].category, Category::Analysis);
        assert_eq!(m.dimensionality().unwrap(), 1);
    }

    #[test]
    fn test_dimensionality_reports_rejected_schema() {
        let m = Measurement::new(ScalarMeasurement::new("temperature", || Ok(4.2), "K"))
            .with_analysis(MapAnalysis::decibel());
        assert!(matches!(
            m.dimensionality(),
            Err(LabsweepError::SchemaMismatch(_))
        ));
    }
}
