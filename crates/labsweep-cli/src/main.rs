//! labsweep CLI: inspect, export and watch run files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::debug;

use labsweep::storage::load_run_metadata;
use labsweep::{
    decode_uuid, Category, DataConfig, DataFile, DatasetHandle, DatasetTable, Mode, RunPath,
    RunStatus,
};

#[derive(Parser)]
#[command(
    name = "labsweep",
    about = "labsweep: inspect and export measurement run files",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
    Parquet,
}

#[derive(Subcommand)]
enum Commands {
    /// Show datasets, text records and views of a run file
    Inspect {
        /// Path to the .arrows file
        file: PathBuf,
        /// Print one text record verbatim instead of the overview
        #[arg(long, short)]
        record: Option<String>,
    },
    /// Export one dataset as a long table (one row per cell)
    Export {
        /// Path to the .arrows file
        file: PathBuf,
        /// Dataset name (searched in data, then analysis) or full path
        dataset: String,
        /// Output format
        #[arg(long, short, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
        /// Output file (default: stdout; required for parquet)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the timestamp encoded in a run identifier
    Decode {
        /// Run identifier, e.g. OT27EO
        id: String,
    },
    /// Print where a run with this name would be written now
    Path {
        /// Run name, e.g. 2D_iv
        name: String,
        /// YAML configuration file
        #[arg(long, short, default_value = "labsweep.yaml")]
        config: PathBuf,
        /// Override the configured data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Follow a running sweep until all datasets are filled or the run ends
    Watch {
        /// Path to the .arrows file
        file: PathBuf,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    labsweep::logging::init_with_level("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { file, record } => {
            cmd_inspect(&file, record.as_deref())?;
        }
        Commands::Export { file, dataset, format, output } => {
            cmd_export(&file, &dataset, format, output)?;
        }
        Commands::Decode { id } => {
            cmd_decode(&id)?;
        }
        Commands::Path { name, config, data_dir } => {
            cmd_path(&name, &config, data_dir)?;
        }
        Commands::Watch { file, interval_ms } => {
            cmd_watch(file, interval_ms).await?;
        }
    }

    Ok(())
}

// ─── Command implementations ──────────────────────────────────────────────────

fn open(file: &Path) -> Result<DataFile> {
    DataFile::open(file, Mode::Read).with_context(|| format!("Failed to open {}", file.display()))
}

fn cmd_inspect(path: &Path, record: Option<&str>) -> Result<()> {
    let file = open(path)?;

    if let Some(name) = record {
        let text = file
            .read_text_record(name)
            .with_context(|| format!("No text record '{}'", name))?;
        print!("{}", text);
        return Ok(());
    }

    println!("File: {}", path.display());
    if let Some(meta) = load_run_metadata(path)? {
        println!("Run: {} ({})", meta.name, meta.uuid);
        println!("Status: {}", meta.status);
        println!("Started: {}", meta.started_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(d) = meta.duration_secs {
            println!("Duration: {}", format_duration(d));
        }
        if let Some(e) = &meta.error {
            println!("Error: {}", e);
        }
    }
    for (key, value) in file.attributes("/") {
        println!("{}: {}", key, display_value(&value));
    }
    println!();

    println!("── Datasets ─────────────────────────────");
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Path", "Type", "Shape", "Unit", "Filled"]);
    for header in file.datasets() {
        let handle = handle_of(&file, &header.path())?;
        let attrs = file.attributes(&header.path());
        let ds_type = attrs.get("ds_type").map(display_value).unwrap_or_default();
        let filled = file.fill_fraction(&handle)?;
        table.add_row([
            header.path(),
            ds_type,
            format!("{:?}", header.shape),
            header.unit.clone(),
            format!("{:.1}%", filled * 100.0),
        ]);
    }
    println!("{}", table);

    let records: Vec<_> = file.text_records().collect();
    if !records.is_empty() {
        println!("── Text records ({}) ─────────────────────", records.len());
        for (path, comment) in records {
            println!("  {} {}", path, comment.unwrap_or(""));
        }
    }

    let views: Vec<_> = file.views().collect();
    if !views.is_empty() {
        println!("── Views ({}) ────────────────────────────", views.len());
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["View", "Type", "xyz"]);
        for (path, view) in views {
            let view_type = serde_json::to_value(&view.view_type)?;
            table.add_row([path.to_string(), display_value(&view_type), view.xyz()]);
        }
        println!("{}", table);
    }

    Ok(())
}

fn cmd_export(path: &Path, dataset: &str, format: ExportFormat, output: Option<PathBuf>) -> Result<()> {
    let file = open(path)?;
    let handle = if dataset.starts_with('/') {
        handle_of(&file, dataset)?
    } else {
        file.get_dataset(dataset, Category::Data)
            .or_else(|| file.get_dataset(dataset, Category::Analysis))
            .with_context(|| format!("No dataset '{}' in {}", dataset, path.display()))?
    };
    let table = DatasetTable::from_file(&file, &handle)?;

    let content = match format {
        ExportFormat::Csv => table.to_csv(),
        ExportFormat::Json => serde_json::to_string_pretty(&table.to_json())? + "\n",
        ExportFormat::Parquet => {
            let out = output.context("--output is required for parquet export")?;
            table.write_parquet(&out)?;
            println!("Exported {} rows to {}", table.num_rows(), out.display());
            return Ok(());
        }
    };

    match output {
        Some(out) => {
            std::fs::write(&out, &content)?;
            println!("Exported {} rows to {}", table.num_rows(), out.display());
        }
        None => print!("{}", content),
    }

    Ok(())
}

fn cmd_decode(id: &str) -> Result<()> {
    let timestamp = decode_uuid(id)?;
    let utc = i64::try_from(timestamp)
        .ok()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .with_context(|| format!("{} is outside the representable date range", timestamp))?;
    println!("{}", timestamp);
    println!("{}", utc.to_rfc3339());
    println!("{}", utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z"));
    Ok(())
}

fn cmd_path(name: &str, config: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    let mut config = DataConfig::load(config)?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    let run = RunPath::new(&config, name);
    println!("{}", run.file_path.display());
    Ok(())
}

async fn cmd_watch(path: PathBuf, interval_ms: u64) -> Result<()> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:32} [{bar:40.cyan/blue}] {pos}/{len}")?
        .progress_chars("=> ");
    let mut bars: Vec<(String, ProgressBar)> = vec![];
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let file = open(&path)?;
                let mut complete = true;
                for header in file.datasets().filter(|h| !h.coordinate) {
                    let ds_path = header.path();
                    let handle = handle_of(&file, &ds_path)?;
                    let (filled, total) = file.fill_count(&handle)?;
                    complete &= filled == total;

                    let bar = match bars.iter().find(|(p, _)| *p == ds_path) {
                        Some((_, bar)) => bar.clone(),
                        None => {
                            let bar = multi.add(ProgressBar::new(total as u64));
                            bar.set_style(style.clone());
                            bar.set_prefix(ds_path.clone());
                            bars.push((ds_path, bar.clone()));
                            bar
                        }
                    };
                    bar.set_length(total as u64);
                    bar.set_position(filled as u64);
                }

                let status = load_run_metadata(&path)?.map(|m| m.status);
                debug!(complete, ?status, "Polled data file");
                if complete || matches!(status, Some(RunStatus::Finished | RunStatus::Failed)) {
                    for (_, bar) in &bars {
                        bar.finish();
                    }
                    match status {
                        Some(status) => println!("Run {}", status),
                        None => println!("All datasets filled"),
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                for (_, bar) in &bars {
                    bar.abandon();
                }
                break;
            }
        }
    }
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn handle_of(file: &DataFile, path: &str) -> Result<DatasetHandle> {
    file.dataset_at(path)
        .with_context(|| format!("No dataset at {}", path))
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
