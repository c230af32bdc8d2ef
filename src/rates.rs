// Rate calibration - distance/delay transmission-rate models
//
// Fits distance ≈ rate × delay by ordinary least squares through the origin
// (a pure propagation-speed relationship has no intercept), once globally
// and once per ordered continent pair. Rates are km/s.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::delays::DelayTable;
use crate::entities::Continent;
use crate::error::GeolocationError;

/// Calibrated transmission rates in km/s.
///
/// A cell of +∞ marks a continent pair with no usable calibration pairs
/// (none measured, or only zero-distance self-pairs); such cells must not be
/// used for delay-to-distance conversion.
#[derive(Debug, Clone)]
pub struct RateTable {
    pub global: f64,
    cells: HashMap<(Continent, Continent), f64>,
}

impl RateTable {
    pub fn from_cells(global: f64, cells: HashMap<(Continent, Continent), f64>) -> Self {
        RateTable { global, cells }
    }

    /// Builds a table with every cell (and the global rate) set to the same
    /// finite rate. Used when continent-level calibration is unavailable.
    pub fn uniform(rate: f64) -> Self {
        let mut cells = HashMap::new();
        for src in Continent::ALL {
            for dst in Continent::ALL {
                cells.insert((src, dst), rate);
            }
        }
        RateTable {
            global: rate,
            cells,
        }
    }

    /// Rate for an ordered continent pair; +∞ for degenerate cells.
    pub fn rate(&self, src: Continent, dst: Continent) -> f64 {
        self.cells.get(&(src, dst)).copied().unwrap_or(f64::INFINITY)
    }

    /// Converts a one-way delay (seconds) to kilometers via the pair's rate.
    /// Returns `None` for degenerate cells.
    pub fn delay_to_distance(&self, delay: f64, src: Continent, dst: Continent) -> Option<f64> {
        let rate = self.rate(src, dst);
        if rate.is_finite() {
            Some(delay * rate)
        } else {
            None
        }
    }

    pub fn cells(&self) -> &HashMap<(Continent, Continent), f64> {
        &self.cells
    }
}

/// OLS-through-origin fit of delay = slope × distance over (distance km,
/// delay s) pairs; the rate is 1/slope, rounded to two decimals.
///
/// Returns +∞ when nothing constrains the slope: no pairs, all distances
/// zero (self-pairs), or a non-positive slope (delays dominated by negative
/// noise).
fn fit_rate(pairs: &[(f64, f64)]) -> f64 {
    let sxx: f64 = pairs.iter().map(|(d, _)| d * d).sum();
    let sxy: f64 = pairs.iter().map(|(d, t)| d * t).sum();
    if sxx == 0.0 {
        return f64::INFINITY;
    }
    let slope = sxy / sxx;
    if slope <= 0.0 || !slope.is_finite() {
        return f64::INFINITY;
    }
    round2(1.0 / slope)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Calibrates the global rate and the full continent × continent matrix from
/// a calibration dataset's delay and distance tables.
///
/// Suspect (negative-delay) pairs are excluded from every fit.
pub fn calibrate(
    dataset: &Dataset,
    delays: &DelayTable,
    distances: &HashMap<(String, String), f64>,
) -> Result<RateTable, GeolocationError> {
    // (frontend continent, file continent, distance, delay) per usable pair
    let mut samples: Vec<(Continent, Continent, f64, f64)> = Vec::new();

    for frontend in &dataset.frontends {
        for file in &dataset.files {
            let key = (frontend.name.clone(), file.name.clone());
            let Some(&distance) = distances.get(&key) else {
                continue;
            };
            let Some(delay) = delays.usable(&frontend.name, &file.name) else {
                continue;
            };
            samples.push((frontend.continent(), file.continent()?, distance, delay));
        }
    }

    let all: Vec<(f64, f64)> = samples.iter().map(|&(_, _, d, t)| (d, t)).collect();
    let global = fit_rate(&all);
    info!(
        pairs = all.len(),
        rate_km_s = global,
        "calibrated global transmission rate"
    );

    let mut cells = HashMap::new();
    for src in Continent::ALL {
        for dst in Continent::ALL {
            let subset: Vec<(f64, f64)> = samples
                .iter()
                .filter(|&&(a, b, _, _)| a == src && b == dst)
                .map(|&(_, _, d, t)| (d, t))
                .collect();
            let rate = fit_rate(&subset);
            debug!(
                src = %src,
                dst = %dst,
                pairs = subset.len(),
                rate_km_s = rate,
                "continent-pair rate"
            );
            cells.insert((src, dst), rate);
        }
    }

    Ok(RateTable::from_cells(global, cells))
}
