// Evaluator - geolocation error metrics
//
// Compares estimates against ground truth when it is available. Without
// ground truth (production mode) the same reports are produced minus the
// error columns; the estimation path is identical either way.

use std::sync::Arc;

use serde::Serialize;

use crate::entities::DataCenter;
use crate::geodesy::{haversine_km, GeoPoint};

/// Outcome for a single target.
///
/// `estimated` is the multilateration coordinate (absent for profiling-only
/// runs); `matched_datacenter` is the snapped or fingerprint-matched
/// candidate. Error fields are only present in evaluation mode.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_datacenter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_error_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact_match: Option<bool>,
    pub converged: bool,
}

/// Aggregates over all evaluated targets of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub targets: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_error_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_error_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rmse_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

/// The candidate datacenter closest to a coordinate, first-encountered-wins
/// on exact ties.
pub fn closest_datacenter<'a>(
    position: GeoPoint,
    candidates: &'a [Arc<DataCenter>],
) -> Option<&'a Arc<DataCenter>> {
    let mut best: Option<(&Arc<DataCenter>, f64)> = None;
    for dc in candidates {
        let d = haversine_km(position, dc.position);
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((dc, d));
        }
    }
    best.map(|(dc, _)| dc)
}

/// Fills the error columns of a report from ground truth: the raw estimate
/// error and the error of the snapped/matched datacenter (the
/// closest-datacenter baseline the raw estimate competes against).
pub fn score_against_truth(
    report: &mut TargetReport,
    truth_position: GeoPoint,
    truth_datacenter: &str,
    candidates: &[Arc<DataCenter>],
) {
    if let Some(estimated) = report.estimated {
        report.error_km = Some(haversine_km(truth_position, estimated));
    }
    if let Some(matched) = &report.matched_datacenter {
        report.exact_match = Some(matched == truth_datacenter);
        if let Some(dc) = candidates.iter().find(|dc| dc.name == *matched) {
            report.matched_error_km = Some(haversine_km(truth_position, dc.position));
        }
    }
}

/// Aggregates the evaluated reports. Targets without error columns (no
/// ground truth) are excluded from the error statistics but still counted.
pub fn summarize(reports: &[TargetReport], skipped: usize) -> BatchSummary {
    let errors: Vec<f64> = reports.iter().filter_map(|r| r.error_km).collect();
    let matches: Vec<bool> = reports.iter().filter_map(|r| r.exact_match).collect();

    let (mean, max, rmse) = if errors.is_empty() {
        (None, None, None)
    } else {
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let max = errors.iter().cloned().fold(f64::MIN, f64::max);
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        (Some(mean), Some(max), Some(rmse))
    };

    let success_rate = if matches.is_empty() {
        None
    } else {
        Some(matches.iter().filter(|&&m| m).count() as f64 / matches.len() as f64)
    };

    BatchSummary {
        targets: reports.len(),
        skipped,
        mean_error_km: mean,
        max_error_km: max,
        rmse_km: rmse,
        success_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Continent;

    fn report(target: &str, error_km: Option<f64>, exact: Option<bool>) -> TargetReport {
        TargetReport {
            target: target.into(),
            estimated: None,
            matched_datacenter: None,
            error_km,
            matched_error_km: None,
            exact_match: exact,
            converged: true,
        }
    }

    #[test]
    fn test_exact_and_offset_targets() {
        // One exactly correct match, one 500 km off
        let reports = vec![
            report("file-1", Some(0.0), Some(true)),
            report("file-2", Some(500.0), Some(false)),
        ];
        let summary = summarize(&reports, 0);
        assert!((summary.mean_error_km.unwrap() - 250.0).abs() < 1e-9);
        assert!((summary.max_error_km.unwrap() - 500.0).abs() < 1e-9);
        assert!((summary.success_rate.unwrap() - 0.5).abs() < 1e-9);
        // RMSE of {0, 500} = 500/sqrt(2)
        assert!((summary.rmse_km.unwrap() - 500.0 / 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_no_ground_truth_mode() {
        let reports = vec![report("file-1", None, None), report("file-2", None, None)];
        let summary = summarize(&reports, 1);
        assert_eq!(summary.targets, 2);
        assert_eq!(summary.skipped, 1);
        assert!(summary.mean_error_km.is_none());
        assert!(summary.success_rate.is_none());
    }

    #[test]
    fn test_closest_datacenter_snap() {
        let candidates = vec![
            Arc::new(DataCenter::new(
                "dc-london",
                GeoPoint::new(51.5, -0.1),
                Continent::Europe,
            )),
            Arc::new(DataCenter::new(
                "dc-frankfurt",
                GeoPoint::new(50.1, 8.7),
                Continent::Europe,
            )),
        ];
        let near_frankfurt = GeoPoint::new(49.9, 8.0);
        let snapped = closest_datacenter(near_frankfurt, &candidates).unwrap();
        assert_eq!(snapped.name, "dc-frankfurt");
        assert!(closest_datacenter(near_frankfurt, &[]).is_none());
    }

    #[test]
    fn test_score_fills_error_columns() {
        let candidates = vec![
            Arc::new(DataCenter::new(
                "dc-a",
                GeoPoint::new(0.0, 0.0),
                Continent::Europe,
            )),
            Arc::new(DataCenter::new(
                "dc-b",
                GeoPoint::new(0.0, 10.0),
                Continent::Europe,
            )),
        ];

        let mut r = report("file-1", None, None);
        r.estimated = Some(GeoPoint::new(0.0, 0.0));
        r.matched_datacenter = Some("dc-a".into());
        score_against_truth(&mut r, GeoPoint::new(0.0, 0.0), "dc-a", &candidates);
        assert!(r.error_km.unwrap().abs() < 1e-9);
        assert!(r.matched_error_km.unwrap().abs() < 1e-9);
        assert_eq!(r.exact_match, Some(true));

        let mut wrong = report("file-2", None, None);
        wrong.matched_datacenter = Some("dc-b".into());
        score_against_truth(&mut wrong, GeoPoint::new(0.0, 0.0), "dc-a", &candidates);
        assert_eq!(wrong.exact_match, Some(false));
        // Snapped ~1113 km away from truth
        assert!(wrong.matched_error_km.unwrap() > 1000.0);
    }
}
