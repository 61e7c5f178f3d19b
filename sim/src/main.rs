//! GINS-SIM: replay and synthetic-data tool for the gins navigation filter.
//!
//! `run` replays a recorded (or generated) sensor text file through the
//! loosely-coupled GNSS/INS filter and writes the fused trajectory in TUM
//! format. `synth` generates reproducible synthetic sensor files from simple
//! motion profiles. `conf` writes a template configuration file with every
//! recognized option.

mod synth;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};

use gins::messages::{PoseWriter, SensorRecord, TextStreamReader};
use gins::sink::SharedSink;
use gins::{FilterConfig, FilterError, Fusion};

use synth::{Profile, SynthOptions};

const LONG_ABOUT: &str = "GINS-SIM: replay and synthetic-data tool for the gins navigation filter.

The filter fuses a 100 Hz IMU stream with sparse GNSS fixes and optional
wheel odometry into a continuous 6-DoF trajectory. This tool replays sensor
text files through the filter, generates synthetic datasets for testing, and
emits template configuration files.

Input format (one record per line, '#' comments skipped):
  IMU  <t> <gx> <gy> <gz> <ax> <ay> <az>
  ODOM <t> <wl> <wr>
  GNSS <t> <lat> <lon> <alt> <heading_deg> <heading_valid_0_or_1>

Output format (one pose per IMU cycle after alignment):
  <t> <tx> <ty> <tz> <qx> <qy> <qz> <qw>

Exit codes: 0 success, 1 I/O error, 2 configuration error, 3 filter
divergence.";

#[derive(Parser)]
#[command(author, version, about = "Replay and synthetic-data tool for the gins navigation filter", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Replay a sensor file through the filter")]
    Run(RunArgs),

    #[command(about = "Generate a synthetic sensor file")]
    Synth(SynthArgs),

    #[command(name = "conf", about = "Write a template configuration file")]
    Conf {
        /// Where to write the template (extension picks the format)
        #[arg(short, long, default_value = "gins.toml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input sensor text file
    #[arg(short, long)]
    input: PathBuf,

    /// Output trajectory file (TUM format)
    #[arg(short, long)]
    output: PathBuf,

    /// Filter configuration (TOML/JSON/YAML); built-in defaults if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log the latest fused state once per second while running
    #[arg(long)]
    monitor: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileKind {
    Static,
    Line,
    Circle,
}

#[derive(Args)]
struct SynthArgs {
    /// Output sensor text file
    #[arg(short, long)]
    output: PathBuf,

    /// Motion profile after the static lead-in
    #[arg(long, value_enum, default_value_t = ProfileKind::Line)]
    profile: ProfileKind,

    /// Total duration in seconds
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// Cruise speed in m/s (line and circle profiles)
    #[arg(long, default_value_t = 5.0)]
    speed: f64,

    /// Circle radius in meters
    #[arg(long, default_value_t = 20.0)]
    radius: f64,

    /// Withhold GNSS from this time, seconds
    #[arg(long, requires = "outage_end")]
    outage_start: Option<f64>,

    /// Withhold GNSS until this time, seconds
    #[arg(long, requires = "outage_start")]
    outage_end: Option<f64>,

    /// Emit dual-antenna headings with the fixes
    #[arg(long)]
    with_heading: bool,

    /// RNG seed for the sensor noise
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn init_logging(level: &str, file: Option<&Path>) {
    let level = level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("unknown log level '{level}', falling back to info");
        log::LevelFilter::Info
    });
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = file {
        match File::create(path) {
            Ok(f) => {
                builder.target(env_logger::Target::Pipe(Box::new(f)));
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", path.display()),
        }
    }
    builder.init();
}

fn run(args: &RunArgs) -> Result<(), FilterError> {
    let config = match &args.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            FilterConfig::load(path)?
        }
        None => FilterConfig::default(),
    };

    let sink = Arc::new(SharedSink::new());
    let mut reader = TextStreamReader::open(&args.input, config.gnss_default_status)?;
    let mut writer = PoseWriter::create(&args.output)?;
    let mut fusion = Fusion::new(config, Arc::clone(&sink))?;

    // Stand-in for the viewer collaborator: reads the snapshot slots on its
    // own thread, never blocking the filter.
    let monitor = args.monitor.then(|| {
        let sink = Arc::clone(&sink);
        std::thread::spawn(move || {
            while !sink.stop_requested() {
                if let Some(state) = sink.latest_nav_state() {
                    info!("fused: {state}");
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        })
    });

    info!("replaying {}", args.input.display());
    let mut poses = 0usize;
    let outcome = (|| {
        for record in reader.by_ref() {
            if sink.stop_requested() {
                info!("stop requested, discarding pending samples");
                break;
            }
            let is_imu = matches!(record, SensorRecord::Imu(_));
            fusion.process(&record)?;
            if is_imu && fusion.initialized() {
                let state = fusion.nav_state();
                writer.write_pose(state.time, &state.se3())?;
                poses += 1;
            }
        }
        writer.flush()
    })();

    sink.request_stop();
    if let Some(handle) = monitor {
        let _ = handle.join();
    }
    outcome?;

    info!(
        "wrote {poses} poses to {}; driver dropped {} records, reader dropped {} lines",
        args.output.display(),
        fusion.dropped_records(),
        reader.dropped()
    );
    Ok(())
}

fn run_synth(args: &SynthArgs) -> Result<(), FilterError> {
    let profile = match args.profile {
        ProfileKind::Static => Profile::Static,
        ProfileKind::Line => Profile::Line { speed: args.speed },
        ProfileKind::Circle => Profile::Circle {
            speed: args.speed,
            radius: args.radius,
        },
    };
    let options = SynthOptions {
        profile,
        duration: args.duration,
        outage: args.outage_start.zip(args.outage_end),
        with_heading: args.with_heading,
        seed: args.seed,
        ..SynthOptions::default()
    };
    synth::generate(&options, &args.output).map_err(|e| FilterError::Io(e.to_string()))?;
    info!(
        "wrote {:.0} s of {:?} data to {}",
        args.duration,
        args.profile,
        args.output.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_file.as_deref());

    let result = match &cli.command {
        Command::Run(args) => run(args),
        Command::Synth(args) => run_synth(args),
        Command::Conf { output } => {
            let res = FilterConfig::default().save(output);
            if res.is_ok() {
                info!("wrote template configuration to {}", output.display());
            }
            res
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            let code: u8 = match e {
                FilterError::Config(_) => 2,
                FilterError::Diverged => 3,
                _ => 1,
            };
            ExitCode::from(code)
        }
    }
}
