// Pipeline orchestration
//
// Threads the pure stages together: resolve references, extract second-hop
// delays, calibrate rates, build fingerprints, then geolocate targets with
// the selected solver. Per-target failures are logged and counted, never
// allowed to abort the batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use tracing::{info, warn};

use crate::dataset::{closest_probes, distance_map, resolve_references, ClosestRefs, Dataset};
use crate::delays::{cross_dataset_delays, extract_delays, DelayTable, ExtractionStrategy};
use crate::entities::{DataCenter, FrontEnd};
use crate::error::GeolocationError;
use crate::evaluate::{closest_datacenter, score_against_truth, TargetReport};
use crate::profile::{build_fingerprints, FingerprintIndex};
use crate::rates::{calibrate, RateTable};
use crate::solver::geolocate_target;

/// Which estimator maps a delay vector to a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SolverStrategy {
    /// Geometric solve: delays → distances → nonlinear least squares.
    Multilateration,
    /// Nearest-neighbor fingerprint matching in delay space.
    Profiling,
}

impl fmt::Display for SolverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SolverStrategy::Multilateration => "multilateration",
            SolverStrategy::Profiling => "profiling",
        })
    }
}

/// Everything learned from the calibration dataset, computed once and
/// treated as immutable by the rest of the run.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub refs: ClosestRefs,
    pub delays: DelayTable,
    pub distances: HashMap<(String, String), f64>,
    pub rates: RateTable,
    pub fingerprints: FingerprintIndex,
}

/// Runs the full calibration pass over a dataset with known file locations.
pub fn calibrate_dataset(
    dataset: &Dataset,
    strategy: ExtractionStrategy,
) -> Result<Calibration, GeolocationError> {
    let refs = resolve_references(dataset)?;
    info!(
        frontends = dataset.frontends.len(),
        "resolved closest probes and baseline files"
    );

    let delays = extract_delays(dataset, &refs, strategy)?;
    let suspects = delays.suspect_pairs().count();
    if suspects > 0 {
        warn!(
            pairs = suspects,
            "negative second-hop delays excluded from calibration"
        );
    }

    let distances = distance_map(dataset)?;
    let rates = calibrate(dataset, &delays, &distances)?;
    let fingerprints = build_fingerprints(dataset, &refs, &delays);

    Ok(Calibration {
        refs,
        delays,
        distances,
        rates,
        fingerprints,
    })
}

/// Collects the usable delay vector for one file: every front-end with a
/// non-suspect extracted delay to it, minus any front-end explicitly
/// excluded (the target's own front-end during self-evaluation).
fn delay_vector<'a>(
    frontends: &'a [FrontEnd],
    delays: &DelayTable,
    file: &str,
    exclude_datacenter: Option<&str>,
) -> Vec<(&'a FrontEnd, f64)> {
    frontends
        .iter()
        .filter(|fe| exclude_datacenter.map_or(true, |dc| fe.datacenter.name != dc))
        .filter_map(|fe| delays.usable(&fe.name, file).map(|d| (fe, d)))
        .collect()
}

/// Runs one target through the selected solver.
fn solve_one(
    solver: SolverStrategy,
    target: &str,
    vector: &[(&FrontEnd, f64)],
    rates: &RateTable,
    fingerprints: &FingerprintIndex,
    candidates: &[Arc<DataCenter>],
) -> Result<TargetReport, GeolocationError> {
    match solver {
        SolverStrategy::Multilateration => {
            let estimate = geolocate_target(target, vector, rates)?;
            let matched = closest_datacenter(estimate.position, candidates);
            Ok(TargetReport {
                target: target.to_string(),
                estimated: Some(estimate.position),
                matched_datacenter: matched.map(|dc| dc.name.clone()),
                error_km: None,
                matched_error_km: None,
                exact_match: None,
                converged: estimate.converged,
            })
        }
        SolverStrategy::Profiling => {
            let features: HashMap<String, f64> = vector
                .iter()
                .map(|&(fe, delay)| (fe.datacenter.name.clone(), delay))
                .collect();
            let Some(matched) = fingerprints.match_target(&features) else {
                return Err(GeolocationError::NoCandidate(target.to_string()));
            };
            let position = candidates
                .iter()
                .find(|dc| dc.name == matched.datacenter)
                .map(|dc| dc.position);
            Ok(TargetReport {
                target: target.to_string(),
                estimated: position,
                matched_datacenter: Some(matched.datacenter),
                error_km: None,
                matched_error_km: None,
                exact_match: None,
                converged: true,
            })
        }
    }
}

/// Self-evaluation over the calibration dataset: each front-end's
/// co-located file becomes a target, located from every *other* front-end's
/// delays and scored against the front-end's own datacenter.
pub fn self_evaluate(
    dataset: &Dataset,
    calibration: &Calibration,
    solver: SolverStrategy,
) -> (Vec<TargetReport>, usize) {
    let candidates: &[Arc<DataCenter>] = if dataset.candidate_datacenters.is_empty() {
        &dataset.datacenters
    } else {
        &dataset.candidate_datacenters
    };
    let fingerprints = calibration
        .fingerprints
        .restrict(candidates.iter().map(|dc| dc.name.as_str()));

    let mut reports = Vec::new();
    let mut skipped = 0usize;

    for frontend in &dataset.frontends {
        let Some(file) = dataset
            .files
            .iter()
            .find(|f| f.datacenter.as_deref().map(|dc| dc.name.as_str())
                == Some(frontend.datacenter.name.as_str()))
        else {
            warn!(
                frontend = %frontend.name,
                "no co-located file, skipping self-evaluation target"
            );
            skipped += 1;
            continue;
        };

        let vector = delay_vector(
            &dataset.frontends,
            &calibration.delays,
            &file.name,
            Some(frontend.datacenter.name.as_str()),
        );

        match solve_one(
            solver,
            &file.name,
            &vector,
            &calibration.rates,
            &fingerprints,
            candidates,
        ) {
            Ok(mut report) => {
                score_against_truth(
                    &mut report,
                    frontend.position(),
                    &frontend.datacenter.name,
                    candidates,
                );
                reports.push(report);
            }
            Err(err) => {
                warn!(target = %file.name, %err, "target skipped");
                skipped += 1;
            }
        }
    }

    (reports, skipped)
}

/// Locates every file of a target dataset using models calibrated on
/// another dataset, optionally scoring against a ground-truth solution
/// (file name → datacenter name).
pub fn locate_targets(
    target: &Dataset,
    calibration_dataset: &Dataset,
    calibration: &Calibration,
    solver: SolverStrategy,
    solution: Option<&HashMap<String, String>>,
) -> Result<(Vec<TargetReport>, usize), GeolocationError> {
    let target_probes = closest_probes(&target.frontends, &target.probes)?;
    let delays =
        cross_dataset_delays(target, &target_probes, calibration_dataset, &calibration.refs)?;
    let suspects = delays.suspect_pairs().count();
    if suspects > 0 {
        warn!(
            pairs = suspects,
            "negative cross-dataset delays excluded from solving"
        );
    }

    let candidates: &[Arc<DataCenter>] = if calibration_dataset.candidate_datacenters.is_empty() {
        &calibration_dataset.datacenters
    } else {
        &calibration_dataset.candidate_datacenters
    };
    let fingerprints = calibration
        .fingerprints
        .restrict(candidates.iter().map(|dc| dc.name.as_str()));

    let mut reports = Vec::new();
    let mut skipped = 0usize;

    for file in &target.files {
        let vector = delay_vector(&target.frontends, &delays, &file.name, None);

        match solve_one(
            solver,
            &file.name,
            &vector,
            &calibration.rates,
            &fingerprints,
            candidates,
        ) {
            Ok(mut report) => {
                if let Some(truth_name) = solution.and_then(|s| s.get(&file.name)) {
                    if let Some(truth) = calibration_dataset
                        .datacenters
                        .iter()
                        .find(|dc| &dc.name == truth_name)
                    {
                        score_against_truth(&mut report, truth.position, truth_name, candidates);
                    }
                }
                reports.push(report);
            }
            Err(err) => {
                warn!(target = %file.name, %err, "target skipped");
                skipped += 1;
            }
        }
    }

    Ok((reports, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Continent, DataFile, ProbeClient};
    use crate::evaluate::summarize;
    use crate::geodesy::{haversine_km, GeoPoint};
    use crate::measurements::{MeasurementRecord, MeasurementTable, MIN_SAMPLES};

    /// Builds a synthetic single-party world: five datacenters spread over
    /// a grid, one front-end and one co-located file each, one probe next
    /// to each front-end. RTTs are composed from a fixed first hop plus
    /// distance at a uniform true rate.
    fn synthetic_world(true_rate: f64) -> Dataset {
        let spots = [
            ("alpha", 0.0, 0.0),
            ("bravo", 0.0, 30.0),
            ("charlie", 30.0, 0.0),
            ("delta", 30.0, 30.0),
            ("echo", 15.0, 15.0),
        ];

        let datacenters: Vec<Arc<DataCenter>> = spots
            .iter()
            .map(|&(name, lat, lon)| {
                Arc::new(DataCenter::new(
                    format!("dc-{name}"),
                    GeoPoint::new(lat, lon),
                    Continent::Europe,
                ))
            })
            .collect();

        let frontends: Vec<FrontEnd> = datacenters
            .iter()
            .map(|dc| FrontEnd {
                name: dc.name.replace("dc-", "fe-"),
                datacenter: dc.clone(),
            })
            .collect();
        let files: Vec<DataFile> = datacenters
            .iter()
            .map(|dc| DataFile::located(dc.name.replace("dc-", "file-"), dc.clone()))
            .collect();
        let probes: Vec<ProbeClient> = datacenters
            .iter()
            .map(|dc| ProbeClient {
                name: dc.name.replace("dc-", "probe-"),
                position: GeoPoint::new(dc.position.lat + 0.5, dc.position.lon),
                continent: Continent::Europe,
            })
            .collect();

        let first_hop = 0.004; // seconds, identical both legs of the pair
        let mut records = Vec::new();
        for (fe, probe) in frontends.iter().zip(&probes) {
            for file in &files {
                let distance = haversine_km(fe.position(), file.position().unwrap());
                let rtt = first_hop + 2.0 * distance / true_rate;
                records.push(MeasurementRecord {
                    probe: probe.name.clone(),
                    frontend: fe.name.clone(),
                    file: file.name.clone(),
                    samples: vec![rtt; MIN_SAMPLES],
                });
            }
        }

        Dataset::new(
            datacenters.clone(),
            datacenters,
            probes,
            frontends,
            files,
            MeasurementTable::from_records(&records).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_calibration_recovers_uniform_rate() {
        let true_rate = 100_000.0;
        let ds = synthetic_world(true_rate);
        let calibration = calibrate_dataset(&ds, ExtractionStrategy::Subtraction).unwrap();

        let relative = (calibration.rates.global - true_rate).abs() / true_rate;
        assert!(relative < 0.01, "global rate {}", calibration.rates.global);
        // Every same-continent pair shares the single Europe/Europe cell
        let cell = calibration.rates.rate(Continent::Europe, Continent::Europe);
        assert!((cell - true_rate).abs() / true_rate < 0.01);
    }

    #[test]
    fn test_self_evaluation_multilateration() {
        let ds = synthetic_world(100_000.0);
        let calibration = calibrate_dataset(&ds, ExtractionStrategy::Subtraction).unwrap();
        let (reports, skipped) =
            self_evaluate(&ds, &calibration, SolverStrategy::Multilateration);

        assert_eq!(skipped, 0);
        assert_eq!(reports.len(), 5);
        let summary = summarize(&reports, skipped);
        // Noise-free synthetic data: estimates land on the datacenters
        assert!(summary.mean_error_km.unwrap() < 50.0);
        assert!((summary.success_rate.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_self_evaluation_profiling() {
        let ds = synthetic_world(100_000.0);
        let calibration = calibrate_dataset(&ds, ExtractionStrategy::Subtraction).unwrap();
        let (reports, skipped) = self_evaluate(&ds, &calibration, SolverStrategy::Profiling);

        assert_eq!(skipped, 0);
        let summary = summarize(&reports, skipped);
        assert!((summary.success_rate.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_optimizer_strategy_end_to_end() {
        let ds = synthetic_world(100_000.0);
        let calibration = calibrate_dataset(&ds, ExtractionStrategy::Optimizer).unwrap();
        let (reports, skipped) =
            self_evaluate(&ds, &calibration, SolverStrategy::Multilateration);

        assert_eq!(skipped, 0);
        let summary = summarize(&reports, skipped);
        assert!((summary.success_rate.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cross_dataset_flow_with_solution() {
        let calibration_ds = synthetic_world(100_000.0);
        let calibration =
            calibrate_dataset(&calibration_ds, ExtractionStrategy::Subtraction).unwrap();

        // Target dataset: new front-ends in two known datacenters, one
        // unknown file physically in dc-echo.
        let dc_alpha = calibration_ds.datacenters[0].clone();
        let dc_bravo = calibration_ds.datacenters[1].clone();
        let dc_charlie = calibration_ds.datacenters[2].clone();
        let dc_delta = calibration_ds.datacenters[3].clone();
        let dc_echo = calibration_ds.datacenters[4].clone();

        let frontends = vec![
            FrontEnd {
                name: "fe-t-alpha".into(),
                datacenter: dc_alpha.clone(),
            },
            FrontEnd {
                name: "fe-t-bravo".into(),
                datacenter: dc_bravo.clone(),
            },
            FrontEnd {
                name: "fe-t-charlie".into(),
                datacenter: dc_charlie.clone(),
            },
            FrontEnd {
                name: "fe-t-delta".into(),
                datacenter: dc_delta.clone(),
            },
        ];
        let files = vec![DataFile::unlocated("file-mystery")];

        let true_rate = 100_000.0;
        let first_hop = 0.004;
        let mut records = Vec::new();
        for fe in &frontends {
            let distance = haversine_km(fe.position(), dc_echo.position);
            let rtt = first_hop + 2.0 * distance / true_rate;
            let probe = fe.datacenter.name.replace("dc-", "probe-");
            records.push(MeasurementRecord {
                probe,
                frontend: fe.name.clone(),
                file: "file-mystery".into(),
                samples: vec![rtt; MIN_SAMPLES],
            });
        }

        let target = Dataset::new(
            calibration_ds.datacenters.clone(),
            vec![],
            calibration_ds.probes.clone(),
            frontends,
            files,
            MeasurementTable::from_records(&records).unwrap(),
        )
        .unwrap();

        let solution: HashMap<String, String> =
            [("file-mystery".to_string(), "dc-echo".to_string())].into();

        let (reports, skipped) = locate_targets(
            &target,
            &calibration_ds,
            &calibration,
            SolverStrategy::Multilateration,
            Some(&solution),
        )
        .unwrap();

        assert_eq!(skipped, 0);
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.matched_datacenter.as_deref(), Some("dc-echo"));
        assert_eq!(report.exact_match, Some(true));
        assert!(report.error_km.unwrap() < 100.0);
    }
}
