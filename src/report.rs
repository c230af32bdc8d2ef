// Result reporting - delay/rate tables, result tables and results.json

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::dataset::Dataset;
use crate::delays::DelayTable;
use crate::entities::Continent;
use crate::error::GeolocationError;
use crate::evaluate::{BatchSummary, TargetReport};
use crate::rates::RateTable;

pub const DELAYS_FILE: &str = "csp-delays.csv";
pub const RATES_FILE: &str = "csp-rates.csv";
pub const RESULTS_FILE: &str = "results.json";

/// Front-end × file matrix of one-way delays in seconds. Unextracted pairs
/// stay empty; suspect pairs keep their negative value, visibly.
pub fn delay_table_csv(dataset: &Dataset, delays: &DelayTable) -> String {
    let mut out = String::new();
    let header: Vec<&str> = dataset.files.iter().map(|f| f.name.as_str()).collect();
    let _ = writeln!(out, ",{}", header.join(","));

    for frontend in &dataset.frontends {
        let _ = write!(out, "{}", frontend.name);
        for file in &dataset.files {
            match delays.get(&frontend.name, &file.name) {
                Some(delay) => {
                    let _ = write!(out, ",{delay:.9}");
                }
                None => out.push(','),
            }
        }
        out.push('\n');
    }
    out
}

/// Continent × continent rate matrix in km/s; degenerate cells print `inf`.
pub fn rates_csv(rates: &RateTable) -> String {
    let mut out = String::new();
    let header: Vec<&str> = Continent::ALL.iter().map(|c| c.as_str()).collect();
    let _ = writeln!(out, ",{}", header.join(","));

    for src in Continent::ALL {
        let _ = write!(out, "{src}");
        for dst in Continent::ALL {
            let rate = rates.rate(src, dst);
            if rate.is_finite() {
                let _ = write!(out, ",{rate}");
            } else {
                let _ = write!(out, ",inf");
            }
        }
        out.push('\n');
    }
    out
}

/// Human-readable rate matrix for the run summary.
pub fn render_rates(rates: &RateTable) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Transmission rates within the CSP network [km/s] (global: {:.2})",
        rates.global
    );
    let _ = write!(out, "{:>12}", "");
    for dst in Continent::ALL {
        let _ = write!(out, " {:>12}", dst.as_str());
    }
    out.push('\n');

    for src in Continent::ALL {
        let _ = write!(out, "{:>12}", src.as_str());
        for dst in Continent::ALL {
            let rate = rates.rate(src, dst);
            if rate.is_finite() {
                let _ = write!(out, " {rate:>12.2}");
            } else {
                let _ = write!(out, " {:>12}", "inf");
            }
        }
        out.push('\n');
    }
    out
}

/// Per-target result table plus the aggregate line.
pub fn render_reports(title: &str, reports: &[TargetReport], summary: &BatchSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}");
    let _ = writeln!(
        out,
        "{:<16} {:>10} {:>10} {:<16} {:>10} {:>12} {:>6}",
        "target", "lat", "lon", "matched", "err [km]", "match [km]", "exact"
    );

    for report in reports {
        let (lat, lon) = report
            .estimated
            .map(|p| (format!("{:.4}", p.lat), format!("{:.4}", p.lon)))
            .unwrap_or_else(|| ("-".into(), "-".into()));
        let _ = writeln!(
            out,
            "{:<16} {:>10} {:>10} {:<16} {:>10} {:>12} {:>6}",
            report.target,
            lat,
            lon,
            report.matched_datacenter.as_deref().unwrap_or("-"),
            report
                .error_km
                .map(|e| format!("{e:.2}"))
                .unwrap_or_else(|| "-".into()),
            report
                .matched_error_km
                .map(|e| format!("{e:.2}"))
                .unwrap_or_else(|| "-".into()),
            report
                .exact_match
                .map(|m| if m { "yes" } else { "no" })
                .unwrap_or("-"),
        );
    }

    let _ = writeln!(
        out,
        "targets: {} evaluated, {} skipped",
        summary.targets, summary.skipped
    );
    if let (Some(mean), Some(max), Some(rmse)) = (
        summary.mean_error_km,
        summary.max_error_km,
        summary.rmse_km,
    ) {
        let _ = writeln!(
            out,
            "error [km]: mean {mean:.2}, max {max:.2}, rmse {rmse:.2}"
        );
    }
    if let Some(rate) = summary.success_rate {
        let _ = writeln!(out, "exact-match rate: {:.1}%", rate * 100.0);
    }
    out
}

/// One batch of results, as written to `results.json`.
#[derive(Debug, Serialize)]
pub struct BatchResults<'a> {
    pub summary: &'a BatchSummary,
    pub targets: &'a [TargetReport],
}

fn rates_json(rates: &RateTable) -> serde_json::Value {
    let mut matrix = serde_json::Map::new();
    for src in Continent::ALL {
        let mut row = serde_json::Map::new();
        for dst in Continent::ALL {
            let rate = rates.rate(src, dst);
            // JSON has no infinity; degenerate cells become null
            row.insert(
                dst.as_str().to_string(),
                if rate.is_finite() {
                    json!(rate)
                } else {
                    serde_json::Value::Null
                },
            );
        }
        matrix.insert(src.as_str().to_string(), row.into());
    }
    json!({ "global_km_s": rates.global, "by_continent": matrix })
}

/// Writes the delay table, rate matrix and results file to `dir`.
pub fn write_outputs(
    dir: &Path,
    dataset: &Dataset,
    delays: &DelayTable,
    rates: &RateTable,
    calibration_results: &BatchResults<'_>,
    target_results: Option<&BatchResults<'_>>,
) -> Result<(), GeolocationError> {
    fs::create_dir_all(dir)?;

    fs::write(dir.join(DELAYS_FILE), delay_table_csv(dataset, delays))?;
    fs::write(dir.join(RATES_FILE), rates_csv(rates))?;

    let results = json!({
        "rates": rates_json(rates),
        "calibration": serde_json::to_value(calibration_results)
            .expect("reports serialize"),
        "targets": target_results
            .map(|r| serde_json::to_value(r).expect("reports serialize")),
    });
    fs::write(
        dir.join(RESULTS_FILE),
        serde_json::to_string_pretty(&results).expect("results serialize"),
    )?;

    info!(dir = %dir.display(), "wrote result files");
    Ok(())
}
