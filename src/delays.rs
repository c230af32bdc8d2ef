// Second-hop delay extraction
//
// Isolates the provider-internal front-end → file transit delay from the
// combined probe → front-end → file RTT. Two interchangeable strategies:
// subtraction against a co-located baseline file, and joint non-negative
// least-squares over all hop delays. Both emit one-way delays (RTT / 2,
// symmetric-path assumption).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use clap::ValueEnum;
use tracing::{error, warn};

use crate::dataset::{ClosestRefs, Dataset};
use crate::error::GeolocationError;

/// Sweep cap for the joint optimizer.
const OPTIMIZER_MAX_SWEEPS: usize = 1000;

/// Convergence threshold on the largest per-sweep parameter change, in
/// seconds. RTTs are in the 1e-3..1e0 range, so 1e-10 is deep in the noise.
const OPTIMIZER_TOLERANCE: f64 = 1e-10;

/// How the front-end → file delay is isolated from the raw RTTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExtractionStrategy {
    /// Subtract the baseline-file RTT measured through the same probe and
    /// front-end; needs a co-located file per front-end.
    Subtraction,
    /// Jointly fit all probe→front-end and front-end→file delays as
    /// non-negative parameters; needs no baseline.
    Optimizer,
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractionStrategy::Subtraction => "subtraction",
            ExtractionStrategy::Optimizer => "optimizer",
        })
    }
}

/// One-way front-end → file delays in seconds.
///
/// Pairs whose extracted delay came out negative are retained with their
/// negative value (clamping would hide a baseline violation) but flagged
/// `suspect`; downstream consumers exclude suspect pairs from rate fitting
/// and from solver input vectors.
#[derive(Debug, Clone, Default)]
pub struct DelayTable {
    one_way: HashMap<(String, String), f64>,
    suspect: BTreeSet<(String, String)>,
}

impl DelayTable {
    fn insert(&mut self, frontend: &str, file: &str, rtt_diff: f64) {
        if rtt_diff < 0.0 {
            error!(
                frontend,
                file,
                rtt_s = rtt_diff,
                "negative second-hop RTT, baseline violated for this pair"
            );
            self.suspect.insert((frontend.to_string(), file.to_string()));
        }
        self.one_way
            .insert((frontend.to_string(), file.to_string()), rtt_diff / 2.0);
    }

    /// One-way delay in seconds, if this pair was extracted.
    pub fn get(&self, frontend: &str, file: &str) -> Option<f64> {
        self.one_way
            .get(&(frontend.to_string(), file.to_string()))
            .copied()
    }

    /// Whether the pair's extracted delay was negative.
    pub fn is_suspect(&self, frontend: &str, file: &str) -> bool {
        self.suspect
            .contains(&(frontend.to_string(), file.to_string()))
    }

    /// Delay usable for calibration and solving: present and not suspect.
    pub fn usable(&self, frontend: &str, file: &str) -> Option<f64> {
        if self.is_suspect(frontend, file) {
            return None;
        }
        self.get(frontend, file)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, String), f64)> {
        self.one_way.iter().map(|(k, v)| (k, *v))
    }

    pub fn suspect_pairs(&self) -> impl Iterator<Item = &(String, String)> {
        self.suspect.iter()
    }

    pub fn len(&self) -> usize {
        self.one_way.len()
    }

    pub fn is_empty(&self) -> bool {
        self.one_way.is_empty()
    }
}

/// Extracts the second-hop delay table for a calibration dataset with the
/// selected strategy.
pub fn extract_delays(
    dataset: &Dataset,
    refs: &ClosestRefs,
    strategy: ExtractionStrategy,
) -> Result<DelayTable, GeolocationError> {
    match strategy {
        ExtractionStrategy::Subtraction => subtraction_delays(dataset, refs),
        ExtractionStrategy::Optimizer => optimizer_delays(dataset, refs),
    }
}

/// Baseline-subtraction strategy.
///
/// For front-end f and file g: RTT(cp(f), f, g) − RTT(cp(f), f, baseline(f)).
/// The probe → front-end leg is identical in both terms and cancels; the
/// baseline file's second hop is assumed ≈ 0.
fn subtraction_delays(
    dataset: &Dataset,
    refs: &ClosestRefs,
) -> Result<DelayTable, GeolocationError> {
    let mut table = DelayTable::default();

    for frontend in &dataset.frontends {
        let probe = &refs.probe_for_frontend[&frontend.name];
        let baseline = &refs.baseline_for_frontend[&frontend.name];
        let baseline_rtt = dataset
            .measurements
            .rtt(probe, &frontend.name, baseline)
            .expect("baseline file selected from measured files");

        for file in &dataset.files {
            let Some(rtt) = dataset.measurements.rtt(probe, &frontend.name, &file.name) else {
                return Err(GeolocationError::MissingMeasurement {
                    probe: probe.clone(),
                    frontend: frontend.name.clone(),
                    file: file.name.clone(),
                });
            };
            table.insert(&frontend.name, &file.name, rtt - baseline_rtt);
        }
    }

    Ok(table)
}

/// Joint-estimation strategy: non-negative least squares over all
/// probe→front-end and front-end→file RTT contributions.
///
/// Minimizes Σ (observed − (first_hop + second_hop))² over parameters ≥ 0,
/// restricted to measurements taken through each front-end's closest probe.
/// The quadratic is convex, so projected Gauss–Seidel coordinate descent
/// converges without tuning; the iteration cap is a safety net and hitting
/// it is surfaced as a warning with the best iterate still used.
fn optimizer_delays(
    dataset: &Dataset,
    refs: &ClosestRefs,
) -> Result<DelayTable, GeolocationError> {
    // Filter to closest-probe measurements and index the parameters.
    // BTreeMaps keep parameter order deterministic.
    let mut first_hop_index: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut second_hop_index: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut observations: Vec<(usize, usize, f64)> = Vec::new();

    // Sort the filtered measurements so parameter indices, and with them the
    // relaxation order, never depend on hash iteration order.
    let mut filtered: Vec<(&(String, String, String), f64)> = dataset
        .measurements
        .iter()
        .filter(|((probe, frontend, _), _)| {
            refs.probe_for_frontend.get(frontend) == Some(probe)
        })
        .collect();
    filtered.sort_by(|a, b| a.0.cmp(b.0));

    for (key, rtt) in filtered {
        let (probe, frontend, file) = key;

        let next_first = first_hop_index.len();
        let i = *first_hop_index
            .entry((probe.clone(), frontend.clone()))
            .or_insert(next_first);
        let next_second = second_hop_index.len();
        let j = *second_hop_index
            .entry((frontend.clone(), file.clone()))
            .or_insert(next_second);
        observations.push((i, j, rtt));
    }

    if observations.is_empty() {
        return Err(GeolocationError::EmptyEntityList("closest-probe measurements"));
    }

    // Membership lists: which observations touch each parameter.
    let mut first_hop_obs: Vec<Vec<usize>> = vec![Vec::new(); first_hop_index.len()];
    let mut second_hop_obs: Vec<Vec<usize>> = vec![Vec::new(); second_hop_index.len()];
    for (m, &(i, j, _)) in observations.iter().enumerate() {
        first_hop_obs[i].push(m);
        second_hop_obs[j].push(m);
    }

    let mut first_hop = vec![0.0_f64; first_hop_index.len()];
    let mut second_hop = vec![0.0_f64; second_hop_index.len()];
    // Residual per observation: observed − estimated. Parameters start at
    // zero, so the initial residual is the observation itself.
    let mut residuals: Vec<f64> = observations.iter().map(|&(_, _, rtt)| rtt).collect();

    let mut converged = false;
    for sweep in 0..OPTIMIZER_MAX_SWEEPS {
        let mut max_change = 0.0_f64;

        let mut relax = |params: &mut Vec<f64>, memberships: &[Vec<usize>]| {
            for (idx, obs_indices) in memberships.iter().enumerate() {
                let mean_residual: f64 =
                    obs_indices.iter().map(|&m| residuals[m]).sum::<f64>()
                        / obs_indices.len() as f64;
                let updated = (params[idx] + mean_residual).max(0.0);
                let change = updated - params[idx];
                if change != 0.0 {
                    for &m in obs_indices {
                        residuals[m] -= change;
                    }
                    params[idx] = updated;
                }
                max_change = max_change.max(change.abs());
            }
        };

        relax(&mut first_hop, &first_hop_obs);
        relax(&mut second_hop, &second_hop_obs);

        if max_change < OPTIMIZER_TOLERANCE {
            converged = true;
            tracing::debug!(sweeps = sweep + 1, "delay optimizer converged");
            break;
        }
    }

    if !converged {
        warn!(
            sweeps = OPTIMIZER_MAX_SWEEPS,
            "delay optimizer hit the sweep cap before converging, using best iterate"
        );
    }

    let mut table = DelayTable::default();
    for ((frontend, file), &j) in &second_hop_index {
        // Parameters are constrained non-negative, so no pair is suspect.
        table.insert(frontend, file, second_hop[j]);
    }
    Ok(table)
}

/// Cross-dataset extraction for target ("3-party") front-ends.
///
/// The baseline RTT cannot come from the target dataset (its files have
/// unknown locations), so each target front-end is anchored against the
/// calibration front-end hosted in the same datacenter: the subtrahend is
/// that front-end's baseline measurement from the calibration dataset. The
/// two datasets must agree on the closest probe for that datacenter;
/// disagreement means the first-hop legs do not cancel and the run is
/// rejected.
pub fn cross_dataset_delays(
    target: &Dataset,
    target_probes: &HashMap<String, String>,
    calibration: &Dataset,
    calibration_refs: &ClosestRefs,
) -> Result<DelayTable, GeolocationError> {
    let mut table = DelayTable::default();

    for frontend in &target.frontends {
        let Some(twin) = calibration.frontend_in(&frontend.datacenter.name) else {
            return Err(GeolocationError::NoCalibrationTwin {
                frontend: frontend.name.clone(),
            });
        };

        let calibration_probe = &calibration_refs.probe_for_frontend[&twin.name];
        let target_probe = &target_probes[&frontend.name];
        if calibration_probe != target_probe {
            return Err(GeolocationError::ClosestProbeMismatch {
                datacenter: frontend.datacenter.name.clone(),
                calibration: calibration_probe.clone(),
                target: target_probe.clone(),
            });
        }

        let baseline = &calibration_refs.baseline_for_frontend[&twin.name];
        let Some(baseline_rtt) =
            calibration
                .measurements
                .rtt(calibration_probe, &twin.name, baseline)
        else {
            return Err(GeolocationError::MissingMeasurement {
                probe: calibration_probe.clone(),
                frontend: twin.name.clone(),
                file: baseline.clone(),
            });
        };

        for file in &target.files {
            let Some(rtt) = target
                .measurements
                .rtt(target_probe, &frontend.name, &file.name)
            else {
                return Err(GeolocationError::MissingMeasurement {
                    probe: target_probe.clone(),
                    frontend: frontend.name.clone(),
                    file: file.name.clone(),
                });
            };
            table.insert(&frontend.name, &file.name, rtt - baseline_rtt);
        }
    }

    Ok(table)
}
