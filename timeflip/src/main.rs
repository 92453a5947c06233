use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use timeflip::core::{ExportMetadata, InputFormat, ResultTable};
use timeflip::options::{DuplicatePolicy, FormatChoice, RepeatPolicy, TransformOptions};
use timeflip::reconcile::{DEFAULT_TOLERANCE, ReconcileOptions};
use timeflip::storage::load_input;
use timeflip::{CsvWriter, LoggingSink, Warning, finalized_for, save_table, transform};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT: &str = "data/transformed_output.csv";

#[derive(Debug, Parser)]
#[command(
    name = "timeflip",
    about = "Reshape Timeflip time-tracking exports into a task-by-week table",
    version
)]
struct Cli {
    /// Export (semicolon weekly blocks) or simple Task,Week,Value CSV.
    input: PathBuf,
    /// Where to write the task-by-week CSV.
    #[arg(short, long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,
    /// Input shape. `auto` checks the header row.
    #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
    format: FormatArg,
    /// Simple input: what to do with a repeated (Task, Week) pair.
    #[arg(long, value_enum, default_value_t = DuplicateArg::Reject)]
    on_duplicate: DuplicateArg,
    /// Export input: how to combine one task listed twice in the same week.
    #[arg(long, value_enum, default_value_t = RepeatArg::Sum)]
    repeated_task: RepeatArg,
    /// Largest declared/daily difference (hours) treated as agreement.
    #[arg(long, default_value_t = DEFAULT_TOLERANCE, value_parser = parse_tolerance)]
    tolerance: f64,
    /// Round written cells (and the Total) to this many decimals.
    /// Without it values are written as read.
    #[arg(long, value_parser = clap::value_parser!(u8).range(..=12))]
    precision: Option<u8>,
    /// Also print the finalized table, metadata and warnings as JSON.
    #[arg(long)]
    json: bool,
    /// Enable verbose logging for debugging.
    #[arg(long)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Auto,
    Simple,
    Complex,
}

impl From<FormatArg> for FormatChoice {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Auto => FormatChoice::Auto,
            FormatArg::Simple => FormatChoice::Simple,
            FormatArg::Complex => FormatChoice::Complex,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DuplicateArg {
    Reject,
    LastWins,
}

impl From<DuplicateArg> for DuplicatePolicy {
    fn from(arg: DuplicateArg) -> Self {
        match arg {
            DuplicateArg::Reject => DuplicatePolicy::Reject,
            DuplicateArg::LastWins => DuplicatePolicy::LastWins,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RepeatArg {
    Sum,
    Overwrite,
}

impl From<RepeatArg> for RepeatPolicy {
    fn from(arg: RepeatArg) -> Self {
        match arg {
            RepeatArg::Sum => RepeatPolicy::Sum,
            RepeatArg::Overwrite => RepeatPolicy::Overwrite,
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    input: String,
    output: String,
    format: InputFormat,
    metadata: &'a ExportMetadata,
    table: &'a ResultTable,
    warnings: &'a [Warning],
}

fn parse_tolerance(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{raw:?}: {e}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{raw:?} is not a finite, non-negative number of hours"));
    }
    Ok(value)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    handle_convert(cli)
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn transform_options(cli: &Cli) -> TransformOptions {
    TransformOptions {
        format: cli.format.into(),
        duplicates: cli.on_duplicate.into(),
        repeats: cli.repeated_task.into(),
        reconcile: ReconcileOptions {
            tolerance: cli.tolerance,
        },
    }
}

fn handle_convert(cli: Cli) -> Result<()> {
    let options = transform_options(&cli);
    let Cli {
        input,
        output,
        precision,
        json,
        ..
    } = cli;

    let text = load_input(&input).with_context(|| format!("loading {:?}", input))?;

    let mut sink = LoggingSink::default();
    let transformed = transform(&text, &options, &mut sink)
        .with_context(|| format!("transforming {:?}", input))?;
    info!(
        format = ?transformed.format,
        weeks = transformed.table.columns.len(),
        tasks = transformed.table.rows.len(),
        "transformed input"
    );
    log_metadata(&transformed.metadata);

    ensure_parent_dir(&output)?;
    let writer = CsvWriter {
        precision,
        ..CsvWriter::default()
    };
    save_table(&transformed.table, &writer, &output)
        .with_context(|| format!("writing {:?}", output))?;
    info!(path = %output.display(), "saved transformed data");

    if json {
        let finalized = finalized_for(&transformed.table, &writer);
        let report = JsonReport {
            input: input.display().to_string(),
            output: output.display().to_string(),
            format: transformed.format,
            metadata: &transformed.metadata,
            table: &finalized,
            warnings: &sink.recorded,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

fn log_metadata(meta: &ExportMetadata) {
    if let Some(account) = &meta.account {
        info!(account = %account, "export account");
    }
    if let (Some(from), Some(to)) = (meta.from, meta.to) {
        info!(%from, %to, "export range");
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
            fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))
        }
        _ => Ok(()),
    }
}
