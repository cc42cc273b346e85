//! Command-line access to an observation store laid out as CSV or Parquet
//! files, one file per table.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use obs_fusion::cursor::parse_timestamp;
use obs_fusion::processor::CSV_FORMAT;
use obs_fusion::{
    Assembly, FusionBackend, ObsFusionConfig, ObservationReader, ObservationRequest, ResponseMode,
    ResultRequest, Selection, TemporalFilter,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "obs-fusion")]
struct Args {
    /// Directory holding one `.csv` or `.parquet` file per table.
    #[arg(long, env = "OBS_FUSION_DATA_DIR")]
    data_dir: PathBuf,

    /// Prints the query counters to stderr on exit.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Result values of one procedure.
    Results(ResultArgs),
    Observations(ObservationArgs),
    Phenomena(SelectionArgs),
    Processes(SelectionArgs),
    /// Time extent of each procedure.
    Times(SelectionArgs),
    /// Historical positions of each procedure.
    Locations(LocationArgs),
}

/// Options narrowing any request.
#[derive(ClapArgs, Debug, Default)]
struct SelectionArgs {
    #[arg(long = "procedure")]
    procedures: Vec<String>,

    #[arg(long = "property")]
    properties: Vec<String>,

    #[arg(long = "feature")]
    features: Vec<String>,

    /// Keeps data at or after this time.
    #[arg(long)]
    after: Option<String>,

    /// Keeps data at or before this time.
    #[arg(long)]
    before: Option<String>,

    #[arg(long)]
    limit: Option<u64>,

    #[arg(long)]
    offset: Option<u64>,
}

#[derive(ClapArgs, Debug)]
struct ResultArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// `text/csv` or `resultArray`.
    #[arg(long, default_value = CSV_FORMAT)]
    format: String,

    #[arg(long)]
    count: bool,

    /// Maximum points returned per key.
    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    include_id: bool,

    #[arg(long)]
    include_quality: bool,
}

#[derive(ClapArgs, Debug)]
struct ObservationArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Field descriptions only.
    #[arg(long)]
    template: bool,

    /// One observation per measurement row.
    #[arg(long)]
    separated: bool,

    #[arg(long)]
    include_quality: bool,
}

#[derive(ClapArgs, Debug)]
struct LocationArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    #[arg(long)]
    width: Option<usize>,
}

impl SelectionArgs {
    fn to_selection(&self) -> Result<Selection> {
        let temporal = match (&self.after, &self.before) {
            (Some(after), Some(before)) => Some(TemporalFilter::During(
                obs_fusion::TimeRange::period(timestamp(after)?, timestamp(before)?),
            )),
            (Some(after), None) => Some(TemporalFilter::After(timestamp(after)?)),
            (None, Some(before)) => Some(TemporalFilter::Before(timestamp(before)?)),
            (None, None) => None,
        };
        Ok(Selection {
            procedures: self.procedures.clone(),
            observed_properties: self.properties.clone(),
            features: self.features.clone(),
            temporal,
            pagination: obs_fusion::filter::Pagination::new(self.offset, self.limit),
            ..Selection::default()
        })
    }
}

fn timestamp(raw: &str) -> Result<chrono::NaiveDateTime> {
    parse_timestamp(raw).ok_or_else(|| anyhow!("invalid timestamp: {raw}"))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serialize response")?;
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("obs_fusion=info,warn")),
        )
        .init();

    let args = Args::parse();
    let config = ObsFusionConfig::from_env()?;
    let backend = FusionBackend::with_config(config.session_config())
        .with_capabilities(config.capabilities());
    let tables = backend
        .register_directory(&args.data_dir)
        .await
        .with_context(|| format!("register tables from {}", args.data_dir.display()))?;
    info!(tables = tables.len(), "store ready");

    let mut reader = ObservationReader::new(Arc::new(backend), config.reader_options());
    match &args.cmd {
        Command::Results(cmd) => {
            let request = ResultRequest {
                selection: cmd.selection.to_selection()?,
                response_format: Some(cmd.format.clone()),
                count_only: cmd.count,
                decimation: cmd.width,
                include_id: cmd.include_id,
                include_quality: cmd.include_quality,
                include_time_for_profile: true,
            };
            print_json(&reader.get_results(&request).await?)?;
        }
        Command::Observations(cmd) => {
            let request = ObservationRequest {
                selection: cmd.selection.to_selection()?,
                mode: if cmd.template {
                    ResponseMode::Template
                } else {
                    ResponseMode::Inline
                },
                assembly: if cmd.separated {
                    Assembly::Separated
                } else {
                    Assembly::Merged
                },
                response_format: Some(CSV_FORMAT.to_string()),
                include_id: false,
                include_quality: cmd.include_quality,
                include_time_for_profile: true,
            };
            print_json(&reader.get_observations(&request).await?)?;
        }
        Command::Phenomena(cmd) => {
            print_json(&reader.get_phenomenons(&cmd.to_selection()?).await?)?;
        }
        Command::Processes(cmd) => {
            print_json(&reader.get_processes(&cmd.to_selection()?).await?)?;
        }
        Command::Times(cmd) => {
            print_json(&reader.get_sensor_times(&cmd.to_selection()?).await?)?;
        }
        Command::Locations(cmd) => {
            let selection = cmd.selection.to_selection()?;
            print_json(
                &reader
                    .get_sensor_historical_locations(&selection, cmd.width)
                    .await?,
            )?;
        }
    }

    if args.metrics {
        eprint!("{}", reader.metrics().render_text());
    }
    Ok(())
}
