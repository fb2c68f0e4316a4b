//! Command-line interface for the rebalancing simulator.

use rebalancer::allocator::{
    Allocator, EqualWeightAllocator, InverseVolatilityAllocator, MinimumVarianceAllocator,
    RiskParityAllocator,
};
use rebalancer::analytics::ResultFormatter;
use rebalancer::config::SimulationConfig;
use rebalancer::data::{load_dir, load_long_csv, CsvOptions, PriceHistory};
use rebalancer::engine::SimulationEngine;
use rebalancer::error::Result;

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Point-in-time portfolio rebalancing simulator.
#[derive(Parser)]
#[command(name = "rebalancer")]
#[command(version)]
#[command(about = "Simulate periodic portfolio rebalancing with factor preselection")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a simulation
    Run {
        /// Simulation config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Prices: a long CSV (date,symbol,price) or a directory of per-symbol CSVs
        #[arg(short, long)]
        prices: PathBuf,

        /// Portfolio construction method
        #[arg(short, long, value_enum, default_value = "equal")]
        allocator: AllocatorArg,

        /// Date format used in the price files
        #[arg(long, default_value = "%Y-%m-%d")]
        date_format: String,

        /// Skip unparseable price rows instead of failing
        #[arg(long)]
        skip_invalid: bool,

        /// Write the full result as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Validate a config file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write a default config file
    InitConfig {
        #[arg(short, long, default_value = "rebalancer.toml")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AllocatorArg {
    Equal,
    InverseVol,
    RiskParity,
    MinVariance,
}

impl AllocatorArg {
    fn build(self) -> Box<dyn Allocator> {
        match self {
            AllocatorArg::Equal => Box::new(EqualWeightAllocator),
            AllocatorArg::InverseVol => Box::new(InverseVolatilityAllocator::default()),
            AllocatorArg::RiskParity => Box::new(RiskParityAllocator::default()),
            AllocatorArg::MinVariance => Box::new(MinimumVarianceAllocator::default()),
        }
    }
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Run {
            config,
            prices,
            allocator,
            date_format,
            skip_invalid,
            json,
        } => {
            let options = CsvOptions {
                date_format: date_format.clone(),
                skip_invalid: *skip_invalid,
                ..Default::default()
            };
            run_simulation(config, prices, *allocator, &options, json.as_deref())
        }
        Commands::Validate { config } => validate_config(config),
        Commands::InitConfig { output } => init_config(output),
    }
}

fn load_prices(path: &Path, options: &CsvOptions) -> Result<PriceHistory> {
    if path.is_dir() {
        load_dir(path, options)
    } else {
        load_long_csv(path, options)
    }
}

fn run_simulation(
    config_path: &Path,
    prices: &Path,
    allocator: AllocatorArg,
    options: &CsvOptions,
    json: Option<&Path>,
) -> Result<()> {
    let mut config = SimulationConfig::load(config_path)?;
    config.simulation.show_progress = true;
    let mut engine = SimulationEngine::from_config(config)?;

    let history = load_prices(prices, options)?;
    let allocator = allocator.build();
    let result = engine.run(&history, allocator.as_ref())?;

    print!("{}", ResultFormatter::report(&result));

    if let Some(path) = json {
        fs::write(path, result.to_json()?)?;
        info!("Wrote result to {}", path.display());
    }
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    let validated = SimulationConfig::load(path)?.validate()?;
    println!("Configuration is valid: {}", path.display());
    println!("  History rows per rebalance: {}", validated.history_rows());
    println!("  Rebalance frequency: {:?}", validated.trigger().frequency);
    match validated.preselection().top_k() {
        Some(k) => println!("  Preselection: top {}", k),
        None => println!("  Preselection: passthrough"),
    }
    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    SimulationConfig::default().save(output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}
