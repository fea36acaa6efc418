//! Integration tests for the sweep engine and adapters against real files.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use labsweep_core::ndarray::{array, ArrayD};
use labsweep_core::{
    Axis, Category, ComplexMeasurement, DataConfig, DataDescriptor, DataFile, Experiment,
    FnMeasurement, LabsweepError, MapAnalysis, Measurement, Mode, PairRatio, ProgressObserver,
    RunMetadata, RunStatus, ScalarMeasurement, StorageError, Sweep, SweepState,
};
use tempfile::TempDir;

fn axis(name: &str, values: &[f64]) -> Axis {
    Axis::new(name, values.to_vec(), "V").unwrap()
}

/// Experiment over x in [0, 1, 2] and y in [0, 1] recording z = 10 x + y.
fn grid_experiment(fail_on_call: Option<usize>) -> Experiment {
    let x = Rc::new(Cell::new(0.0));
    let y = Rc::new(Cell::new(0.0));
    let calls = Rc::new(Cell::new(0));
    let (sx, sy, gx, gy) = (x.clone(), y.clone(), x, y);

    let mut experiment = Experiment::new("grid");
    experiment
        .sweep(Sweep::new(axis("x", &[0.0, 1.0, 2.0]), move |v| {
            sx.set(v);
            Ok(())
        }))
        .sweep(Sweep::new(axis("y", &[0.0, 1.0]), move |v| {
            sy.set(v);
            Ok(())
        }))
        .measure(ScalarMeasurement::new(
            "z",
            move || {
                calls.set(calls.get() + 1);
                if Some(calls.get()) == fail_on_call {
                    anyhow::bail!("instrument timeout");
                }
                Ok(gx.get() * 10.0 + gy.get())
            },
            "A",
        ));
    experiment
}

fn z_values(file: &DataFile) -> ArrayD<f64> {
    let z = file.get_dataset("z", Category::Data).unwrap();
    file.read_array(&z).unwrap()
}

#[test]
fn test_nested_sweep_fills_c_order() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("grid.arrows"), Mode::Write).unwrap();
    let mut experiment = grid_experiment(None);
    experiment.run_in(&mut file).unwrap();

    assert_eq!(
        z_values(&file),
        array![[0.0, 1.0], [10.0, 11.0], [20.0, 21.0]].into_dyn()
    );
    let attrs = file.attributes("/entry/data0/z");
    assert_eq!(attrs["x_ds_url"], "/entry/data0/x");
    assert_eq!(attrs["y_ds_url"], "/entry/data0/y");
    assert_eq!(attrs["unit"], "A");

    let root = experiment.root_sweep().unwrap();
    assert_eq!(root.state(), SweepState::Completed);
    assert_eq!(root.current_value(), None);
    assert_eq!(root.child().unwrap().state(), SweepState::Completed);
}

#[test]
fn test_failing_getter_keeps_earlier_points() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("crash.arrows");
    let mut file = DataFile::open(&path, Mode::Write).unwrap();

    // Fails on the 4th point, (1, 1).
    let mut experiment = grid_experiment(Some(4));
    let err = experiment.run_in(&mut file).unwrap_err();
    assert!(matches!(err, LabsweepError::Instrument(_)));
    assert!(err.to_string().contains("instrument timeout"));

    let check = |values: ArrayD<f64>| {
        let flat: Vec<f64> = values.iter().copied().collect();
        assert_eq!(&flat[..3], &[0.0, 1.0, 10.0]);
        assert!(flat[3..].iter().all(|v| v.is_nan()));
    };
    check(z_values(&file));
    drop(file);
    check(z_values(&DataFile::open(&path, Mode::Read).unwrap()));

    let root = experiment.root_sweep().unwrap();
    assert_eq!(root.state(), SweepState::Aborted);
    assert_eq!(root.child().unwrap().state(), SweepState::Aborted);
}

#[test]
fn test_failing_setter_aborts_before_measuring() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("s.arrows"), Mode::Write).unwrap();
    let mut experiment = Experiment::new("setter");
    experiment
        .sweep(Sweep::new(axis("x", &[0.0, 1.0, 2.0]), |v| {
            if v > 0.5 {
                anyhow::bail!("out of range: {v}");
            }
            Ok(())
        }))
        .measure(ScalarMeasurement::new("z", || Ok(5.0), "A"));

    let err = experiment.run_in(&mut file).unwrap_err();
    assert!(err.to_string().contains("out of range: 1"));
    let z = z_values(&file);
    assert_eq!(z[[0]], 5.0);
    assert!(z[[1]].is_nan() && z[[2]].is_nan());
}

#[test]
fn test_rerun_into_same_file_is_refused() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("again.arrows");
    {
        let mut file = DataFile::open(&path, Mode::Write).unwrap();
        grid_experiment(None).run_in(&mut file).unwrap();
    }

    // Identical structure is accepted, the first populated cell is not.
    let mut file = DataFile::open(&path, Mode::Append).unwrap();
    let err = grid_experiment(None).run_in(&mut file).unwrap_err();
    match err {
        LabsweepError::Overwrite { path, index } => {
            assert_eq!(path, "/entry/data0/z");
            assert_eq!(index, vec![0, 0]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(z_values(&file)[[2, 1]], 21.0);
}

#[test]
fn test_append_mode_conflicting_structure() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("conflict.arrows");
    {
        let mut file = DataFile::open(&path, Mode::Write).unwrap();
        let mut experiment = Experiment::new("a");
        experiment
            .sweep(Sweep::new(axis("x", &[0.0, 1.0]), |_| Ok(())))
            .measure(ScalarMeasurement::new("z", || Ok(1.0), "A"));
        experiment.run_in(&mut file).unwrap();
    }

    let mut file = DataFile::open(&path, Mode::Append).unwrap();
    let mut experiment = Experiment::new("b");
    experiment
        .sweep(Sweep::new(axis("x", &[0.0, 1.0, 2.0]), |_| Ok(())))
        .measure(ScalarMeasurement::new("z", || Ok(1.0), "A"));
    assert!(matches!(
        experiment.run_in(&mut file),
        Err(LabsweepError::NameConflict { .. })
    ));
}

#[test]
fn test_filtered_sweep_leaves_cells_empty() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("f.arrows"), Mode::Write).unwrap();
    let mut experiment = Experiment::new("filtered");
    experiment
        .sweep(Sweep::new(axis("x", &[0.0, 1.0, 2.0, 3.0]), |_| Ok(())).filtered(|v| v >= 2.0))
        .measure(ScalarMeasurement::new("z", || Ok(7.0), "A"));
    experiment.run_in(&mut file).unwrap();

    let z = z_values(&file);
    assert_eq!(z.shape(), &[4]);
    assert!(z[[0]].is_nan() && z[[1]].is_nan());
    assert_eq!(z[[2]], 7.0);
    assert_eq!(z[[3]], 7.0);
}

#[test]
fn test_outer_measurements_run_before_inner_sweep() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("o.arrows"), Mode::Write).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let (a, b, c) = (order.clone(), order.clone(), order.clone());

    let mut experiment = Experiment::new("order");
    experiment.measure(ScalarMeasurement::new(
        "t",
        move || {
            a.borrow_mut().push("t");
            Ok(4.2)
        },
        "K",
    ));
    let outer = experiment.sweep(Sweep::new(axis("x", &[0.0, 1.0]), |_| Ok(())));
    outer.measure(ScalarMeasurement::new(
        "outer",
        move || {
            b.borrow_mut().push("outer");
            Ok(1.0)
        },
        "V",
    ));
    outer
        .sweep(Sweep::new(axis("y", &[0.0, 1.0]), |_| Ok(())))
        .measure(ScalarMeasurement::new(
            "inner",
            move || {
                c.borrow_mut().push("inner");
                Ok(2.0)
            },
            "V",
        ));
    experiment.run_in(&mut file).unwrap();

    assert_eq!(
        *order.borrow(),
        ["t", "outer", "inner", "inner", "outer", "inner", "inner"]
    );
    let t = file.get_dataset("t", Category::Data).unwrap();
    assert_eq!(file.header(&t).unwrap().shape, Vec::<usize>::new());
    assert_eq!(file.read_array(&t).unwrap().sum(), 4.2);
}

#[test]
fn test_analysis_chain_and_views() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("a.arrows"), Mode::Write).unwrap();
    let freq = axis("f", &[1.0, 2.0]);
    let bias = Axis::new("i_b_0", vec![1.0, 2.0, 4.0], "A").unwrap();

    let mut experiment = Experiment::new("chain");
    let sweep = experiment.sweep(Sweep::new(axis("g", &[0.0, 1.0]), |_| Ok(())));
    sweep.measure(
        Measurement::from(ComplexMeasurement::new("s21", vec![freq], "V", || {
            Ok(vec![(10.0, 0.0), (0.0, 100.0)])
        }))
        .with_analysis(MapAnalysis::decibel()),
    );
    let b = bias.clone();
    sweep.measure(
        Measurement::from(FnMeasurement::new(
            vec![
                DataDescriptor::new("i_0", vec![bias.clone()], "A"),
                DataDescriptor::new("v_0", vec![bias], "V"),
            ],
            move || {
                let i = ArrayD::from_shape_vec(vec![3], b.range().to_vec())?;
                let v = i.mapv(|i| 2.0 * i);
                Ok(vec![i, v])
            },
        ))
        .with_analysis(PairRatio::resistance()),
    );
    experiment.run_in(&mut file).unwrap();

    let db = file.get_dataset("s21_db", Category::Analysis).unwrap();
    assert_eq!(
        file.read_array(&db).unwrap(),
        array![[20.0, 40.0], [20.0, 40.0]].into_dyn()
    );
    let attrs = file.attributes("/entry/analysis0/s21_db");
    assert_eq!(attrs["ds_type"], "analysis");
    assert_eq!(attrs["analysis_type"], "transform");

    let r = file.get_dataset("r_0", Category::Analysis).unwrap();
    assert!(file.read_array(&r).unwrap().iter().all(|&v| v == 2.0));

    let view = file.resolve_view("r_0_vs_i_0").unwrap();
    assert_eq!(view.x.path(), "/entry/data0/i_0");
    assert_eq!(view.y.path(), "/entry/analysis0/r_0");
    assert!(file.resolve_view("s21_db").is_ok());
    assert!(file.resolve_view("s21_IQ").is_ok());
}

#[test]
fn test_schema_mismatch_is_reported() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("m.arrows"), Mode::Write).unwrap();
    let trace = DataDescriptor::new("trace", vec![axis("f", &[1.0, 2.0])], "V");
    let mut experiment = Experiment::new("mismatch");
    experiment.measure(FnMeasurement::new(vec![trace], || Ok(vec![])));
    assert!(matches!(
        experiment.run_in(&mut file),
        Err(LabsweepError::SchemaMismatch(_))
    ));
}

#[derive(Default)]
struct Recorder(Rc<RefCell<Vec<String>>>);

impl ProgressObserver for Recorder {
    fn sweep_started(&mut self, axis: &str, points: usize) {
        self.0.borrow_mut().push(format!("start {axis} {points}"));
    }

    fn point_done(&mut self, axis: &str, done: usize, points: usize) {
        self.0.borrow_mut().push(format!("{axis} {done}/{points}"));
    }

    fn sweep_finished(&mut self, axis: &str, state: SweepState) {
        self.0.borrow_mut().push(format!("end {axis} {state}"));
    }
}

#[test]
fn test_progress_observer_sees_every_point() {
    let tmp = TempDir::new().unwrap();
    let mut file = DataFile::open(tmp.path().join("p.arrows"), Mode::Write).unwrap();
    let events = Rc::new(RefCell::new(vec![]));
    let mut experiment = Experiment::new("progress").with_observer(Recorder(events.clone()));
    experiment
        .sweep(Sweep::new(axis("x", &[0.0, 1.0]), |_| Ok(())))
        .measure(ScalarMeasurement::new("z", || Ok(1.0), "A"));
    experiment.run_in(&mut file).unwrap();

    assert_eq!(
        *events.borrow(),
        ["start x 2", "x 1/2", "x 2/2", "end x completed"]
    );
}

#[test]
fn test_run_writes_metadata_log_and_records() {
    let tmp = TempDir::new().unwrap();
    let config = DataConfig::new(tmp.path()).with_flat_layout("cooldown", "ada");
    let mut experiment = grid_experiment(None)
        .with_comment("first cooldown")
        .with_settings(serde_json::json!({"lockin": {"tau": 0.3}}));

    let run = experiment.run(&config).unwrap();
    assert!(run.stem.ends_with("_2D_grid"));
    assert!(run.file_path.starts_with(tmp.path().join("COOLDOWN").join("ada")));

    let meta: RunMetadata =
        serde_yaml::from_str(&std::fs::read_to_string(run.metadata_path()).unwrap()).unwrap();
    assert_eq!(meta.status, RunStatus::Finished);
    assert_eq!(meta.dimensionality, 2);
    assert_eq!(meta.uuid, run.uuid);
    assert!(meta.duration_secs.is_some());

    let log = std::fs::read_to_string(run.log_path()).unwrap();
    assert!(log.contains("Run started"));
    assert!(log.contains("Run finished"));

    let file = DataFile::open(&run.file_path, Mode::Read).unwrap();
    let settings: serde_json::Value =
        serde_json::from_str(file.read_text_record("settings").unwrap()).unwrap();
    assert_eq!(settings["lockin"]["tau"], 0.3);
    let measurement: serde_json::Value =
        serde_json::from_str(file.read_text_record("measurement").unwrap()).unwrap();
    assert_eq!(measurement["dimensionality"], 2);
    assert_eq!(file.attributes("/")["comment"], "first cooldown");
    assert_eq!(z_values(&file)[[2, 1]], 21.0);
}

#[test]
fn test_failed_run_is_marked_failed() {
    let tmp = TempDir::new().unwrap();
    let config = DataConfig::new(tmp.path());
    let mut experiment = grid_experiment(Some(2));
    assert!(experiment.run(&config).is_err());

    let day = std::fs::read_dir(tmp.path()).unwrap().next().unwrap().unwrap().path();
    let folder = std::fs::read_dir(day).unwrap().next().unwrap().unwrap().path();
    let meta: RunMetadata =
        serde_yaml::from_str(&std::fs::read_to_string(folder.join("run.yaml")).unwrap()).unwrap();
    assert_eq!(meta.status, RunStatus::Failed);
    assert!(meta.error.unwrap().contains("instrument timeout"));
}

#[test]
fn test_second_run_in_same_second_keeps_first_run() {
    let tmp = TempDir::new().unwrap();
    let config = DataConfig::new(tmp.path());
    let started = chrono::Local::now();

    let first = grid_experiment(None).run_at(&config, &started).unwrap();
    let err = grid_experiment(Some(1)).run_at(&config, &started).unwrap_err();
    assert!(matches!(
        err,
        LabsweepError::Storage(StorageError::RunExists(_))
    ));

    let file = DataFile::open(&first.file_path, Mode::Read).unwrap();
    assert_eq!(
        z_values(&file),
        array![[0.0, 1.0], [10.0, 11.0], [20.0, 21.0]].into_dyn()
    );
    let meta: RunMetadata =
        serde_yaml::from_str(&std::fs::read_to_string(first.metadata_path()).unwrap()).unwrap();
    assert_eq!(meta.status, RunStatus::Finished);
}

#[test]
fn test_back_to_back_runs_both_survive() {
    let tmp = TempDir::new().unwrap();
    let config = DataConfig::new(tmp.path());

    let first = grid_experiment(None).run(&config).unwrap();
    // Same second lands on the same folder and is refused; a later second
    // gets its own folder.
    match grid_experiment(None).run(&config) {
        Ok(second) => assert_ne!(second.folder, first.folder),
        Err(e) => assert!(matches!(e, LabsweepError::Storage(StorageError::RunExists(_)))),
    }

    let file = DataFile::open(&first.file_path, Mode::Read).unwrap();
    assert_eq!(z_values(&file)[[2, 1]], 21.0);
}
