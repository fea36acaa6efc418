//! Sweep engine: nested parameter sweeps driving measurements into a data file.
//!
//! An [`Experiment`] is the root of a tree. Every node holds any number of
//! measurements and at most one child [`Sweep`]. At each point a node first
//! records its own measurements, then runs its child sweep, so the outer axis
//! varies slowest and the dataset layout is C order.
//!
//! Every recorded point is durable before the next setter call. When a setter
//! or getter fails the error propagates to the caller and the file keeps all
//! points written so far.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Local, TimeZone, Utc};
use tracing::{debug, error, info};

use crate::adapter::Measurement;
use crate::config::DataConfig;
use crate::error::Result;
use crate::logging;
use crate::models::{Axis, DataDescriptor, RunMetadata, RunStatus};
use crate::naming::RunPath;
use crate::storage::{self, DataFile, Mode};

/// Moves an instrument to a sweep value. Blocks until the hardware confirms.
pub type Setter = Box<dyn FnMut(f64) -> anyhow::Result<()>>;

/// Lifecycle of a sweep node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Configured,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepState::Configured => write!(f, "configured"),
            SweepState::Running => write!(f, "running"),
            SweepState::Completed => write!(f, "completed"),
            SweepState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Receives sweep progress events. All methods default to no-ops.
pub trait ProgressObserver {
    fn sweep_started(&mut self, _axis: &str, _points: usize) {}
    fn point_done(&mut self, _axis: &str, _done: usize, _points: usize) {}
    fn sweep_finished(&mut self, _axis: &str, _state: SweepState) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// Measurements and an optional child sweep, shared by experiments and sweeps.
#[derive(Default)]
struct Stage {
    measurements: Vec<Measurement>,
    child: Option<Box<Sweep>>,
}

impl Stage {
    fn measure(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
    }

    fn sweep(&mut self, sweep: Sweep) -> &mut Sweep {
        if let Some(old) = &self.child {
            debug!(axis = %old.axis.name(), "Replacing child sweep");
        }
        self.child.insert(Box::new(sweep))
    }

    fn dimensionality(&self) -> Result<usize> {
        let mut dim = 0;
        for measurement in &self.measurements {
            dim = dim.max(measurement.dimensionality()?);
        }
        if let Some(child) = &self.child {
            dim = dim.max(1 + child.stage.dimensionality()?);
        }
        Ok(dim)
    }

    fn structure(&self, swept: &mut Vec<Axis>, out: &mut Vec<DataDescriptor>) -> Result<()> {
        for measurement in &self.measurements {
            out.extend(measurement.structure(swept)?);
        }
        if let Some(child) = &self.child {
            swept.push(child.axis.clone());
            child.stage.structure(swept, out)?;
            swept.pop();
        }
        Ok(())
    }

    fn create_datasets(&self, file: &mut DataFile, swept: &mut Vec<Axis>) -> Result<()> {
        for measurement in &self.measurements {
            measurement.create_datasets(file, swept)?;
        }
        if let Some(child) = &self.child {
            swept.push(child.axis.clone());
            child.stage.create_datasets(file, swept)?;
            swept.pop();
        }
        Ok(())
    }

    fn run(
        &mut self,
        file: &mut DataFile,
        indices: &mut Vec<usize>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<()> {
        for measurement in &mut self.measurements {
            measurement.record(file, indices)?;
        }
        if let Some(child) = &mut self.child {
            child.run(file, indices, observer)?;
        }
        Ok(())
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        for measurement in &self.measurements {
            writeln!(f, "{indent}- {measurement}")?;
        }
        if let Some(child) = &self.child {
            writeln!(f, "{indent}- {}", child.header())?;
            child.stage.fmt_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

/// One swept axis with the setter that moves the hardware along it.
pub struct Sweep {
    axis: Axis,
    setter: Setter,
    filter: Option<Box<dyn Fn(f64) -> bool>>,
    stage: Stage,
    state: SweepState,
    current_value: Option<f64>,
}

impl Sweep {
    pub fn new(axis: Axis, setter: impl FnMut(f64) -> anyhow::Result<()> + 'static) -> Self {
        Self {
            axis,
            setter: Box::new(setter),
            filter: None,
            stage: Stage::default(),
            state: SweepState::Configured,
            current_value: None,
        }
    }

    /// Only visit axis values satisfying `predicate`. The dataset keeps the
    /// full axis length; skipped cells stay empty.
    pub fn filtered(mut self, predicate: impl Fn(f64) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Record `measurement` at every point of this sweep.
    pub fn measure(&mut self, measurement: impl Into<Measurement>) -> &mut Self {
        self.stage.measure(measurement.into());
        self
    }

    /// Nest `sweep` inside this one and return it for further configuration.
    pub fn sweep(&mut self, sweep: Sweep) -> &mut Sweep {
        self.stage.sweep(sweep)
    }

    pub fn axis(&self) -> &Axis {
        &self.axis
    }

    pub fn child(&self) -> Option<&Sweep> {
        self.stage.child.as_deref()
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Value most recently set, while the sweep is running.
    pub fn current_value(&self) -> Option<f64> {
        self.current_value
    }

    /// `(index, value)` pairs visited by this sweep, in order.
    pub fn points(&self) -> Vec<(usize, f64)> {
        self.axis
            .range()
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| self.filter.as_ref().map_or(true, |keep| keep(*v)))
            .collect()
    }

    fn header(&self) -> String {
        let filtered = if self.filter.is_some() { ", filtered" } else { "" };
        format!("Sweep({}{filtered})", self.axis)
    }

    fn run(
        &mut self,
        file: &mut DataFile,
        indices: &mut Vec<usize>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<()> {
        self.state = SweepState::Running;
        let result = self.run_points(file, indices, observer);
        self.current_value = None;
        self.state = if result.is_ok() {
            SweepState::Completed
        } else {
            SweepState::Aborted
        };
        observer.sweep_finished(self.axis.name(), self.state);
        result
    }

    fn run_points(
        &mut self,
        file: &mut DataFile,
        indices: &mut Vec<usize>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<()> {
        let points = self.points();
        let total = points.len();
        observer.sweep_started(self.axis.name(), total);

        for (done, (index, value)) in points.into_iter().enumerate() {
            debug!(axis = %self.axis.name(), value, "Setting sweep value");
            if let Err(e) = (self.setter)(value) {
                error!(axis = %self.axis.name(), value, error = %e, "Failed to set sweep value");
                return Err(e.into());
            }
            self.current_value = Some(value);

            indices.push(index);
            let recorded = self.stage.run(file, indices, observer);
            indices.pop();
            recorded?;

            observer.point_done(self.axis.name(), done + 1, total);
        }
        Ok(())
    }
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header())?;
        self.stage.fmt_tree(f, 1)
    }
}

/// Root of a sweep tree.
pub struct Experiment {
    name: String,
    comment: Option<String>,
    settings: Option<serde_json::Value>,
    stage: Stage,
    observer: Box<dyn ProgressObserver>,
}

impl Experiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comment: None,
            settings: None,
            stage: Stage::default(),
            observer: Box::new(NoProgress),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Instrument settings stored as the `settings` text record.
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Record `measurement` once, outside any sweep.
    pub fn measure(&mut self, measurement: impl Into<Measurement>) -> &mut Self {
        self.stage.measure(measurement.into());
        self
    }

    /// Set the outermost sweep and return it for further configuration.
    pub fn sweep(&mut self, sweep: Sweep) -> &mut Sweep {
        self.stage.sweep(sweep)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outermost sweep, if any.
    pub fn root_sweep(&self) -> Option<&Sweep> {
        self.stage.child.as_deref()
    }

    /// Largest number of axes of any dataset this experiment creates.
    pub fn dimensionality(&self) -> Result<usize> {
        self.stage.dimensionality()
    }

    /// `<dim>D_<name>`, used for the run folder and file names.
    pub fn file_stem(&self) -> Result<String> {
        Ok(format!("{}D_{}", self.dimensionality()?, self.name))
    }

    /// Every dataset the experiment will create, with full axes, without
    /// touching storage or hardware.
    pub fn structure(&self) -> Result<Vec<DataDescriptor>> {
        let mut out = vec![];
        self.stage.structure(&mut vec![], &mut out)?;
        Ok(out)
    }

    /// Create all datasets in `file` and run the sweep tree against it.
    pub fn run_in(&mut self, file: &mut DataFile) -> Result<()> {
        let structure = self.structure()?;
        self.stage.create_datasets(file, &mut vec![])?;

        if let Some(settings) = &self.settings {
            file.write_text_record(
                "settings",
                &serde_json::to_string_pretty(settings)?,
                Some("instrument settings"),
            )?;
        }
        let description = serde_json::json!({
            "name": self.name,
            "dimensionality": self.dimensionality()?,
            "comment": self.comment,
            "datasets": structure
                .iter()
                .map(|d| d.category.path_of(&d.name))
                .collect::<Vec<_>>(),
        });
        file.write_text_record(
            "measurement",
            &serde_json::to_string_pretty(&description)?,
            Some("experiment structure"),
        )?;
        if let Some(comment) = &self.comment {
            file.set_attribute("/", "comment", comment.as_str())?;
        }
        file.flush()?;

        info!(experiment = %self.name, datasets = structure.len(), "Starting experiment");
        let Self { stage, observer, .. } = self;
        stage.run(file, &mut vec![], observer.as_mut())
    }

    /// Run into a fresh file below `config.data_dir`.
    ///
    /// Alongside the data file this writes `run.yaml` (status RUNNING, then
    /// FINISHED or FAILED) and a `<stem>.log` with every log line of the run.
    pub fn run(&mut self, config: &DataConfig) -> Result<RunPath> {
        self.run_at(config, &Local::now())
    }

    /// [`Experiment::run`] with the run folder named after `timestamp`.
    ///
    /// Fails with [`crate::StorageError::RunExists`] before touching anything when
    /// the folder is already taken.
    pub fn run_at<Tz: TimeZone>(
        &mut self,
        config: &DataConfig,
        timestamp: &DateTime<Tz>,
    ) -> Result<RunPath>
    where
        Tz::Offset: fmt::Display,
    {
        let run_path = RunPath::at(config, &self.file_stem()?, timestamp);
        run_path.mkdirs()?;
        let _log = logging::open_run_log(&run_path.log_path())?;

        let mut meta = RunMetadata {
            name: self.name.clone(),
            uuid: run_path.uuid.clone(),
            file: run_path.file_name.clone(),
            status: RunStatus::Running,
            dimensionality: self.dimensionality()?,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            comment: self.comment.clone(),
            error: None,
        };
        storage::save_yaml(&run_path.metadata_path(), &meta)?;
        info!(
            experiment = %self.name,
            uuid = %run_path.uuid,
            path = %run_path.file_path.display(),
            "Run started\n{}",
            self
        );

        let start = Instant::now();
        let result = self.run_to_path(&run_path);

        meta.finished_at = Some(Utc::now());
        meta.duration_secs = Some(start.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                meta.status = RunStatus::Finished;
                info!(experiment = %self.name, secs = meta.duration_secs, "Run finished");
            }
            Err(e) => {
                meta.status = RunStatus::Failed;
                meta.error = Some(e.to_string());
                error!(experiment = %self.name, error = %e, "Run failed");
            }
        }
        storage::save_yaml(&run_path.metadata_path(), &meta)?;
        result.map(|()| run_path)
    }

    fn run_to_path(&mut self, run_path: &RunPath) -> Result<()> {
        let mut file = DataFile::open(&run_path.file_path, Mode::Write)?;
        self.run_in(&mut file)?;
        file.close()
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiment({})", self.name)?;
        self.stage.fmt_tree(f, 1)
    }
}
