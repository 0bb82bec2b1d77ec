//! CLI entry point for the rock magnetometer station.
//!
//! ```bash
//! rockmag home
//! rockmag measure --specimen BH-12a --level 0
//! rockmag sequence --specimen BH-12a
//! rockmag --simulate --yes sequence --specimen demo
//! rockmag holder
//! rockmag standard
//! rockmag ports
//! ```
//!
//! Ctrl-C cancels the running step at the next stage boundary; steps already
//! stored are kept. Settings (including accepted calibrations and raised
//! ranges) are written back to the profile on exit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rockmag_daq::config::Settings;
use rockmag_daq::logging::{self, OutputFormat, TracingConfig};
use rockmag_daq::operator::{AutoOperator, Notice, Operator, Prompt};
use rockmag_daq::serial::available_ports;
use rockmag_daq::sim::SimWorld;
use rockmag_daq::specimen::{SampleInfo, SpecimenFile};
use rockmag_daq::station::Station;
use rockmag_daq::workflows::{self, AfSchedule, CalibrationOutcome, StepOutcome};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "rockmag")]
#[command(about = "Rock magnetometer, AF demagnetizer and sample handler control", long_about = None)]
struct Cli {
    /// Station profile
    #[arg(long, default_value = "config/rockmag.toml")]
    config: PathBuf,

    /// Use simulated instruments instead of serial ports
    #[arg(long)]
    simulate: bool,

    /// Answer every prompt with yes
    #[arg(long)]
    yes: bool,

    /// Log output: pretty, compact or json
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Home the sample handler
    Home,
    /// Measure one step of a specimen
    Measure {
        /// Specimen name
        #[arg(long)]
        specimen: String,
        /// AF level in mT (0 measures without AF)
        #[arg(long, default_value_t = 0.0)]
        level: f64,
    },
    /// Run the configured AF demagnetization sequence on a specimen
    Sequence {
        /// Specimen name
        #[arg(long)]
        specimen: String,
    },
    /// Measure the empty holder
    Holder,
    /// Measure the calibration standard
    Standard,
    /// List serial ports
    Ports,
}

/// Operator at the terminal.
struct ConsoleOperator {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleOperator {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn confirm(&self, prompt: &Prompt) -> bool {
        println!("{prompt} [y/N]");
        match self.lines.lock().await.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }

    fn notify(&self, notice: &Notice) {
        println!("{notice}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    let format: OutputFormat = cli.log_format.parse()?;
    logging::init(TracingConfig::from_settings(&settings)?.with_format(format))?;

    if let Commands::Ports = cli.command {
        let ports = available_ports()?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{port}");
        }
        return Ok(());
    }

    let mut station = if cli.simulate {
        let world = SimWorld::new(&settings);
        world.set_noise(1.0e-10);
        Station::simulated(settings, &world)?
    } else {
        Station::connect(settings).await?
    };

    let cancel = station.cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Cancel requested");
            cancel.cancel();
        }
    });

    let operator: Box<dyn Operator> = if cli.yes {
        Box::new(AutoOperator::accepting())
    } else {
        Box::new(ConsoleOperator::new())
    };

    let result = run(&mut station, operator.as_ref(), &cli.command).await;
    let shutdown = station.shutdown().await;
    if cli.simulate {
        tracing::info!("Simulated run, profile left unchanged");
    } else {
        station
            .settings
            .save(&cli.config)
            .with_context(|| format!("saving {}", cli.config.display()))?;
    }
    result?;
    shutdown?;
    Ok(())
}

fn open_specimen(station: &Station, name: &str) -> Result<SpecimenFile> {
    let path = SpecimenFile::path_for(&station.settings.application.data_dir, name)?;
    let file = SpecimenFile::open_or_create(&path, SampleInfo::named(name))
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(file)
}

async fn run(station: &mut Station, operator: &dyn Operator, command: &Commands) -> Result<()> {
    station.initialize(operator).await?;

    match command {
        Commands::Home | Commands::Ports => {}
        Commands::Measure { specimen, level } => {
            let mut file = open_specimen(station, specimen)?;
            match workflows::measure_specimen(station, operator, &mut file, *level).await? {
                StepOutcome::Recorded(record) => println!(
                    "Step {}: {:.1} mT  M={:.3e} emu  D={:.1} I={:.1}",
                    record.step,
                    record.level_mt,
                    record.total_moment,
                    record.in_situ.declination,
                    record.in_situ.inclination
                ),
                StepOutcome::Cancelled => println!("Cancelled"),
            }
        }
        Commands::Sequence { specimen } => {
            let mut file = open_specimen(station, specimen)?;
            let schedule = AfSchedule::new(station.settings.sequence);
            let report = workflows::run_sequence(station, operator, &mut file, schedule).await?;
            for record in &report.recorded {
                println!(
                    "Step {:>3}: {:>6.1} mT  M={:.3e} emu  D={:.1} I={:.1}",
                    record.step,
                    record.level_mt,
                    record.total_moment,
                    record.in_situ.declination,
                    record.in_situ.inclination
                );
            }
            if report.cancelled {
                println!("Sequence cancelled after {} steps", report.recorded.len());
            }
        }
        Commands::Holder => report_calibration("Holder moment", workflows::measure_holder(station, operator).await?),
        Commands::Standard => report_calibration(
            "Calibration constants",
            workflows::measure_standard(station, operator).await?,
        ),
    }
    Ok(())
}

fn report_calibration(what: &str, outcome: CalibrationOutcome) {
    match outcome {
        CalibrationOutcome::Accepted(v) => println!("{what} stored: {:.4e} {:.4e} {:.4e}", v.x, v.y, v.z),
        CalibrationOutcome::Rejected(v) => println!("{what} not stored: {:.4e} {:.4e} {:.4e}", v.x, v.y, v.z),
        CalibrationOutcome::Cancelled => println!("Cancelled"),
    }
}
