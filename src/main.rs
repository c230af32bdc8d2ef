// Geodelay - Main Entry Point
// Licensed under AGPL v3
//
// Batch pipeline: load the calibration dataset, extract second-hop delays,
// calibrate the rate models, self-evaluate, then locate the target dataset's
// files when one is present.

use clap::Parser;
use tracing::{info, warn};

use geodelay::config::Config;
use geodelay::evaluate::summarize;
use geodelay::parsers;
use geodelay::pipeline;
use geodelay::report::{self, BatchResults};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Loading calibration dataset from {}", config.input_dir.display());
    let calibration_dataset = parsers::load_calibration_dataset(&config.input_dir)?;

    let calibration = pipeline::calibrate_dataset(&calibration_dataset, config.extraction)?;
    print!("{}", report::render_rates(&calibration.rates));
    println!();

    let (calibration_reports, calibration_skipped) =
        pipeline::self_evaluate(&calibration_dataset, &calibration, config.solver);
    let calibration_summary = summarize(&calibration_reports, calibration_skipped);
    print!(
        "{}",
        report::render_reports(
            "Calibration self-evaluation",
            &calibration_reports,
            &calibration_summary
        )
    );
    println!();

    let mut target_reports = None;
    if config.calibration_only {
        info!("Skipping target dataset (--calibration-only)");
    } else {
        match parsers::load_target_dataset(&config.input_dir, &calibration_dataset)? {
            None => info!("No target dataset present"),
            Some(target_dataset) => {
                let solution = parsers::load_solution(&config.input_dir, &target_dataset)?;
                if solution.is_none() {
                    info!("No ground-truth solution, reporting estimates only");
                }

                let (reports, skipped) = pipeline::locate_targets(
                    &target_dataset,
                    &calibration_dataset,
                    &calibration,
                    config.solver,
                    solution.as_ref(),
                )?;
                let summary = summarize(&reports, skipped);
                if skipped > 0 {
                    warn!(skipped, "some targets could not be located");
                }
                print!(
                    "{}",
                    report::render_reports("Target geolocation", &reports, &summary)
                );
                target_reports = Some((reports, summary));
            }
        }
    }

    if let Some(output_dir) = &config.output_dir {
        let calibration_results = BatchResults {
            summary: &calibration_summary,
            targets: &calibration_reports,
        };
        let target_results = target_reports.as_ref().map(|(reports, summary)| BatchResults {
            summary,
            targets: reports,
        });
        report::write_outputs(
            output_dir,
            &calibration_dataset,
            &calibration.delays,
            &calibration.rates,
            &calibration_results,
            target_results.as_ref(),
        )?;
    }

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
