//! Application entry point: mic-beamformer.
//!
//! # Startup sequence
//!
//! 1. Parse the command line.
//! 2. Load [`BeamformerConfig`] (explicit `--config` path or the platform
//!    default) and apply command-line overrides.
//! 3. Initialise logging.
//! 4. Install the Ctrl-C handler; it only sets a shutdown flag.
//! 5. Build and start the pipeline on the selected driver.
//! 6. Wait for the flag, then stop the pipeline and dump the log history if
//!    asked to.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use mic_beamformer::{
    config::{AppPaths, BeamformerConfig},
    device::{CpalDriver, PcmDriver, SimulatedDriver, ToneSpec},
    logging::{init_logging, LogHistory},
    pipeline::BeamformerPipeline,
};

/// Real-time microphone-array beamformer
#[derive(Parser)]
#[command(name = "mic-beamformer", version, about)]
struct Cli {
    /// Capture device name ("default" for the host default)
    #[arg(short, long)]
    input: Option<String>,

    /// Playback device name ("default" for the host default)
    #[arg(short, long)]
    output: Option<String>,

    /// Enable (1) or disable (0) informational logging; errors are always logged
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=1))]
    log: Option<u8>,

    /// Settings file to use instead of the platform default
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the built-in simulated devices instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Write the in-memory log history on exit (to PATH, or the default
    /// data-directory file when no path is given)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    dump_logs: Option<Option<PathBuf>>,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Seconds between status lines
    #[arg(long, default_value = "5")]
    status_secs: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e:#}");
            eprintln!("mic-beamformer: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<BeamformerConfig> {
    let mut config = match &cli.config {
        Some(path) => BeamformerConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BeamformerConfig::load().context("failed to load settings")?,
    };

    if let Some(input) = &cli.input {
        config.devices.input = input.clone();
    }
    if let Some(output) = &cli.output {
        config.devices.output = output.clone();
    }
    if let Some(level) = cli.log {
        config.logging.enabled = level == 1;
    }
    match &cli.dump_logs {
        Some(Some(path)) => config.logging.dump_path = Some(path.clone()),
        Some(None) => config.logging.dump_path = Some(AppPaths::new().log_dump_file(chrono::Local::now())),
        None => {}
    }
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let history = init_logging(&config.logging).context("failed to install logger")?;
    log::info!("mic-beamformer starting up");

    if cli.list_devices {
        let (inputs, outputs) = CpalDriver::list_devices()?;
        println!("input devices:");
        inputs.iter().for_each(|name| println!("  {name}"));
        println!("output devices:");
        outputs.iter().for_each(|name| println!("  {name}"));
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Release))
            .context("failed to install Ctrl-C handler")?;
    }

    let driver: Arc<dyn PcmDriver> = if cli.simulate {
        let tone = ToneSpec {
            channel_delay: 3.0,
            ..ToneSpec::default()
        };
        Arc::new(SimulatedDriver::new().with_tone(tone).realtime(true))
    } else {
        Arc::new(CpalDriver::new())
    };
    log::info!("using {} driver", driver.name());

    let dump_path = config.logging.dump_path.clone();
    let outcome = run_pipeline(config, driver, &shutdown, Duration::from_secs(cli.status_secs.max(1)));

    if let Some(path) = dump_path {
        dump_history(&history, &path);
    }
    outcome
}

fn run_pipeline(
    config: BeamformerConfig,
    driver: Arc<dyn PcmDriver>,
    shutdown: &AtomicBool,
    status_every: Duration,
) -> anyhow::Result<()> {
    let mut pipeline = BeamformerPipeline::new(config, driver)?;
    pipeline.start().context("failed to start pipeline")?;
    log::info!("running; press Ctrl-C to stop");

    pipeline.run_until(shutdown, status_every);

    log::info!("shutdown requested");
    pipeline.stop();
    log::info!(
        "final state {} (last error: {}), steering angle {}°",
        pipeline.state(),
        pipeline.last_error(),
        pipeline.current_angle()
    );
    Ok(())
}

fn dump_history(history: &LogHistory, path: &std::path::Path) {
    match history.dump_to(path) {
        Ok(lines) => eprintln!("wrote {lines} log lines to {}", path.display()),
        Err(e) => eprintln!("failed to dump logs to {}: {e}", path.display()),
    }
}
