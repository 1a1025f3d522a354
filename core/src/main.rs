//! DVLNAV: run the DVL/IMU navigation filter over recorded or synthetic logs.
//!
//! - `run` plays a DVL log through the filter and writes one row of estimates per log row.
//! - `simulate` writes a synthetic log for a vehicle under constant acceleration.
//! - `config` writes a configuration template (JSON or TOML by extension).
//!
//! Filter parameters come from `--config` when given and from built-in defaults otherwise.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use log::{error, info};

use dvlnav::config::{FailurePolicy, FilterConfig};
use dvlnav::sim::{Scenario, read_log, run_filter, synthesize, write_log, write_results};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Extended Kalman filter for a four-beam DVL aided by an IMU."
)]
struct Cli {
    /// Filter configuration file (JSON/TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Verbosity of the diagnostic log
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Run the filter over a DVL log
    Run(RunArgs),
    /// Write a synthetic DVL log
    Simulate(SimulateArgs),
    /// Write a configuration template
    Config {
        /// Output path (.json or .toml)
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Input DVL log (CSV)
    #[arg(short, long)]
    input: PathBuf,
    /// Output estimates (CSV)
    #[arg(short, long)]
    output: PathBuf,
    /// Overrides the configured failure policy
    #[arg(long, value_enum)]
    on_failure: Option<FailurePolicy>,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output DVL log (CSV)
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long, default_value_t = 200)]
    samples: usize,
    /// Sample spacing in seconds
    #[arg(long, default_value_t = 0.2)]
    dt: f64,
    /// Body acceleration: longitudinal, transverse, vertical (m/s^2)
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true, default_values_t = [0.1, 0.0, 0.0])]
    accel: Vec<f64>,
    /// Vertical distance to the seabed in meters
    #[arg(long, default_value_t = 10.0)]
    sounding: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Per-sample probability that a beam loses lock
    #[arg(long, default_value_t = 0.0)]
    beam_dropout: f64,
    /// Per-sample probability of an IMU fault
    #[arg(long, default_value_t = 0.0)]
    imu_dropout: f64,
    /// Standard deviation of the along-beam velocity noise (m/s)
    #[arg(long, default_value_t = 0.0)]
    velocity_noise: f64,
    /// Standard deviation of the slant range noise (m)
    #[arg(long, default_value_t = 0.0)]
    range_noise: f64,
}

/// Open `path` for appending, creating its directory if needed.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Route `log` records to stderr, or to `log_file` when given, with millisecond timestamps.
fn init_logger(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.into())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    if let Some(path) = log_file {
        let file = open_log_file(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FilterConfig> {
    match path {
        Some(p) => {
            info!("Loading configuration from {}", p.display());
            FilterConfig::from_file(p)
                .with_context(|| format!("failed to load configuration {}", p.display()))
        }
        None => Ok(FilterConfig::default()),
    }
}

fn run(args: &RunArgs, mut config: FilterConfig) -> Result<()> {
    if let Some(policy) = args.on_failure {
        config.on_failure = policy;
    }
    let records = read_log(&args.input)?;
    info!(
        "Running filter over {} samples from {}",
        records.len(),
        args.input.display()
    );
    let results = run_filter(&records, &config)?;
    write_results(&results, &args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Wrote {} estimates to {}", results.len(), args.output.display());
    Ok(())
}

fn simulate(args: &SimulateArgs, config: &FilterConfig) -> Result<()> {
    let scenario = Scenario {
        samples: args.samples,
        delta_time: args.dt,
        acceleration: [args.accel[0], args.accel[1], args.accel[2]],
        sounding: args.sounding,
        mounting_angle_deg: config.mounting_angle_deg,
        velocity_noise: args.velocity_noise,
        range_noise: args.range_noise,
        beam_dropout: args.beam_dropout,
        imu_dropout: args.imu_dropout,
        ..Scenario::default()
    };
    let records = synthesize(&scenario, args.seed)?;
    write_log(&records, &args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        "Wrote {} synthetic samples to {}",
        records.len(),
        args.output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.log_file.as_deref())?;

    let config = load_config(cli.config.as_deref())?;
    let outcome = match &cli.command {
        Command::Run(args) => run(args, config),
        Command::Simulate(args) => simulate(args, &config),
        Command::Config { output } => config
            .to_file(output)
            .with_context(|| format!("failed to write {}", output.display())),
    };
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}
