//! CLI wiring for the kernel configuration planner.

use crate::config::PlannerConfig;
use crate::descriptor::parse_descriptor;
use crate::driver::{run_mode, OutputFormat, PlannerMode};
use crate::session::PlannerSession;
use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use kernelplan_backend::{DeviceFile, PresetDevice};
use kernelplan_kernels::DeviceQuery;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "kernelplan",
    version,
    about = "Batch-normalization kernel configuration planner",
    group(ArgGroup::new("mode").args(["bench", "search", "auto_search"]).multiple(false))
)]
pub struct Cli {
    /// Plan, then measure the planned configuration.
    #[arg(long)]
    pub bench: bool,

    /// Measure every configuration and keep the fastest in the registry.
    #[arg(long)]
    pub search: bool,

    /// Rebuild the registry for the selected device.
    #[arg(long)]
    pub auto_search: bool,

    /// Cost model (`analytical` or `bandwidth`).
    #[arg(long)]
    pub model: Option<String>,

    /// Device preset (`xe-hpg`, `xe-hpc`).
    #[arg(long, default_value = "xe-hpc", conflicts_with = "device_file")]
    pub device: String,

    /// JSON file describing the device.
    #[arg(long)]
    pub device_file: Option<PathBuf>,

    /// Replacement approximation table.
    #[arg(long)]
    pub table: Option<PathBuf>,

    /// Plan registry file.
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Wall-clock budget for search and rebuild.
    #[arg(long)]
    pub budget_secs: Option<u64>,

    #[arg(long, default_value_t = 1)]
    pub warmup: usize,

    #[arg(long, default_value_t = 5)]
    pub runs: usize,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Kernel descriptor, e.g. `dir=fwd dt=f32 mb=32 ih=56 iw=56 ic=64`.
    #[arg(value_name = "KEY=VALUE")]
    pub descriptor: Vec<String>,
}

impl Cli {
    pub fn mode(&self) -> PlannerMode {
        if self.bench {
            PlannerMode::Bench
        } else if self.search {
            PlannerMode::Search
        } else if self.auto_search {
            PlannerMode::AutoSearch
        } else {
            PlannerMode::Trace
        }
    }

    /// Environment-derived defaults with command-line overrides applied.
    pub fn config(&self) -> PlannerConfig {
        let mut config = PlannerConfig::from_env();
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(path) = &self.registry {
            config.registry_path = Some(path.clone());
        }
        config.table_path = self.table.clone();
        config.budget = self.budget_secs.map(Duration::from_secs);
        config.warmup_runs = self.warmup;
        config.runs = self.runs;
        config
    }

    fn device(&self) -> Result<Box<dyn DeviceQuery>> {
        let device: Box<dyn DeviceQuery> = match &self.device_file {
            Some(path) => Box::new(DeviceFile::new(path)),
            None => Box::new(self.device.parse::<PresetDevice>()?),
        };
        Ok(device)
    }
}

/// Parse the descriptor, build a session and render the report.
pub fn execute(cli: &Cli) -> Result<String> {
    let mode = cli.mode();
    let workload = if cli.descriptor.is_empty() {
        if mode.needs_descriptor() {
            bail!("missing kernel descriptor (e.g. `sp=3136 ic=64`)");
        }
        None
    } else {
        Some(parse_descriptor(&cli.descriptor).context("invalid kernel descriptor")?)
    };

    let device = cli.device()?;
    let session = PlannerSession::new(cli.config(), device.as_ref())?;
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    run_mode(&session, mode, workload.as_ref(), format)
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();

    let report = execute(&cli)?;
    print!("{report}");
    Ok(())
}

/// Process entry point: 0 on success (including `--help`), 1 on any
/// argument or planning failure.
pub fn run_from_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { 1 } else { 0 };
        }
    };
    match run_cli(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}
