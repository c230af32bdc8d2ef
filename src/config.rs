use std::path::PathBuf;

use clap::Parser;

use crate::delays::ExtractionStrategy;
use crate::pipeline::SolverStrategy;

/// Geodelay configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory containing the dataset CSV files (datacenters, servers,
    /// measurements, optional solution).
    #[arg(value_name = "DIR")]
    pub input_dir: PathBuf,

    /// Write the delay table, rate matrix and results.json to this directory.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Second-hop delay extraction strategy.
    #[arg(long, value_enum, default_value_t = ExtractionStrategy::Subtraction)]
    pub extraction: ExtractionStrategy,

    /// Geolocation solver.
    #[arg(long, value_enum, default_value_t = SolverStrategy::Multilateration)]
    pub solver: SolverStrategy,

    /// Calibrate and self-evaluate only; skip the target dataset even when
    /// its files are present.
    #[arg(long, default_value_t = false)]
    pub calibration_only: bool,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
