use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{fs::File, io::stdout, path::PathBuf};
use topmetal_daq::*;

#[derive(Parser, Debug)]
#[command(version, about = "Waveform acquisition for Topmetal readout boards")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "topmetal.toml")]
    config: PathBuf,

    /// Output file, overriding the configured one
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Acquire from the built-in simulator instead of a board
    #[arg(long)]
    simulate: bool,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// More log output; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Show a live status line
    #[arg(long)]
    status: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("could not create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, file));
    }
    CombinedLogger::init(loggers).context("could not initialize logging")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut settings = match Conf::load(&args.config) {
        Ok(settings) => settings,
        Err(ConfigError::Invalid(problems)) => {
            for problem in &problems {
                log::error!("{}", problem);
            }
            bail!(
                "{} problem(s) in config file {}",
                problems.len(),
                args.config.display()
            );
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(output) = &args.output {
        settings.output.filename = output.clone();
    }
    println!("{}", settings);

    if args.simulate {
        info!("Using the simulated digitizer");
        return run_with(SimDigitizer::new(), &settings, args.status);
    }

    run_hardware(&settings, args.status)
}

#[cfg(feature = "caen")]
fn run_hardware(settings: &Settings, status: bool) -> Result<()> {
    run_with(CaenDigitizer::new(), settings, status)
}

#[cfg(not(feature = "caen"))]
fn run_hardware(_settings: &Settings, _status: bool) -> Result<()> {
    bail!("built without the `caen` feature; rerun with --simulate or rebuild with it")
}

fn run_with<D: Digitizer>(hw: D, settings: &Settings, status: bool) -> Result<()> {
    let mut controller = DigitizerController::new(hw);
    controller
        .configure(&settings.acquisition)
        .context("could not configure digitizer")?;

    let sink = WaveformSink::create(&settings.output.filename).with_context(|| {
        format!(
            "could not open output file {}",
            settings.output.filename.display()
        )
    })?;
    info!("Writing waveforms to {}", settings.output.filename.display());

    let plan = RunPlan::from_settings(settings);
    let mut acquisition = AcquisitionLoop::new(controller, sink, plan)?;
    let mut log_monitor = LogMonitor::new(settings.output.verbose);
    let summary = if status {
        acquisition.run(&mut (log_monitor, StatusLine::new(stdout())))?
    } else {
        acquisition.run(&mut log_monitor)?
    };

    println!("Number of Events: {}", summary.processed);
    Ok(())
}
