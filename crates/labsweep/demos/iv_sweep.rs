//! Simulated transport measurement: a gate sweep with an IV trace and a
//! resonator spectrum at every gate voltage.
//!
//! Run with `cargo run -p labsweep --example iv_sweep -- ./data`.

use std::cell::Cell;
use std::rc::Rc;

use labsweep::ndarray::Array1;
use labsweep::{
    Axis, ComplexMeasurement, DataConfig, DataDescriptor, Experiment, FnMeasurement, MapAnalysis,
    Measurement, PairRatio, ScalarMeasurement, Sweep,
};

fn main() -> anyhow::Result<()> {
    labsweep::logging::init();
    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());

    let gate = Rc::new(Cell::new(0.0));
    let bias = Axis::linspace("i_b_0", -1e-6, 1e-6, 21, "A")?;
    let freq = Axis::linspace("f", 4.0e9, 4.1e9, 201, "Hz")?;

    let mut experiment = Experiment::new("gate_iv")
        .with_comment("simulated device")
        .with_settings(serde_json::json!({ "fridge_temperature_K": 0.02 }));
    experiment.measure(ScalarMeasurement::new("t_start", || Ok(0.02), "K"));

    let gate_setter = gate.clone();
    let sweep = experiment.sweep(Sweep::new(
        Axis::linspace("v_gate", -1.0, 1.0, 11, "V")?,
        move |v| {
            gate_setter.set(v);
            Ok(())
        },
    ));

    // IV trace: resistance depends on the gate voltage.
    let iv_gate = gate.clone();
    let bias_values = bias.range().to_vec();
    let iv = FnMeasurement::new(
        vec![
            DataDescriptor::new("i_0", vec![bias.clone()], "A"),
            DataDescriptor::new("v_0", vec![bias.clone()], "V"),
        ],
        move || {
            let r = 1e3 * (1.0 + iv_gate.get().powi(2));
            let i = Array1::from(bias_values.clone());
            let v = i.mapv(|i| r * i);
            Ok(vec![i.into_dyn(), v.into_dyn()])
        },
    );
    sweep.measure(Measurement::from(iv).with_analysis(PairRatio::resistance()));

    // Resonator whose frequency shifts with the gate.
    let vna_gate = gate;
    let f_values = freq.range().to_vec();
    let vna = ComplexMeasurement::new("s21", vec![freq], "V", move || {
        let f0 = 4.05e9 + 1e6 * vna_gate.get();
        Ok(f_values
            .iter()
            .map(|f| {
                let detuning = (f - f0) / 1e6;
                let denominator = 1.0 + detuning * detuning;
                (1.0 - 0.9 / denominator, 0.9 * detuning / denominator)
            })
            .collect())
    });
    sweep.measure(Measurement::from(vna).with_analysis(MapAnalysis::decibel()));

    println!("{experiment}");
    for descriptor in experiment.structure()? {
        println!("  {} {:?} [{}]", descriptor.category.path_of(&descriptor.name), descriptor.shape(), descriptor.unit);
    }

    let run = experiment.run(&DataConfig::new(data_dir))?;
    println!("wrote {}", run.file_path.display());
    Ok(())
}
