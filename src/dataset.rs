// Dataset container and closest-reference resolution
//
// A dataset bundles the declared entities with the aggregated measurement
// table. The resolver derives, per front-end, the geographically closest
// probe and the file with minimum RTT through that probe; the latter is
// assumed co-located with the front-end and serves as the zero-second-hop
// baseline for delay extraction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::entities::{DataCenter, DataFile, FrontEnd, ProbeClient};
use crate::error::GeolocationError;
use crate::geodesy::haversine_km;
use crate::measurements::MeasurementTable;

/// All declared entities of one dataset plus its measurement table.
///
/// `candidate_datacenters` is the subset offered as possible target
/// locations; datacenters marked learn-only calibrate the models but are
/// never proposed as an answer.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub datacenters: Vec<Arc<DataCenter>>,
    pub candidate_datacenters: Vec<Arc<DataCenter>>,
    pub probes: Vec<ProbeClient>,
    pub frontends: Vec<FrontEnd>,
    pub files: Vec<DataFile>,
    pub measurements: MeasurementTable,
}

impl Dataset {
    /// Bundles the parts after validating the measurement table against the
    /// declared entities.
    pub fn new(
        datacenters: Vec<Arc<DataCenter>>,
        candidate_datacenters: Vec<Arc<DataCenter>>,
        probes: Vec<ProbeClient>,
        frontends: Vec<FrontEnd>,
        files: Vec<DataFile>,
        measurements: MeasurementTable,
    ) -> Result<Self, GeolocationError> {
        if probes.is_empty() {
            return Err(GeolocationError::EmptyEntityList("probes"));
        }
        if frontends.is_empty() {
            return Err(GeolocationError::EmptyEntityList("front-ends"));
        }
        if files.is_empty() {
            return Err(GeolocationError::EmptyEntityList("files"));
        }
        measurements.validate(&probes, &frontends, &files)?;
        Ok(Dataset {
            datacenters,
            candidate_datacenters,
            probes,
            frontends,
            files,
            measurements,
        })
    }

    pub fn frontend(&self, name: &str) -> Option<&FrontEnd> {
        self.frontends.iter().find(|fe| fe.name == name)
    }

    pub fn file(&self, name: &str) -> Option<&DataFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// First front-end hosted in the named datacenter.
    pub fn frontend_in(&self, datacenter: &str) -> Option<&FrontEnd> {
        self.frontends
            .iter()
            .find(|fe| fe.datacenter.name == datacenter)
    }
}

/// Per-front-end reference selections used as delay-extraction baselines.
#[derive(Debug, Clone)]
pub struct ClosestRefs {
    /// Front-end name → name of its geographically closest probe.
    pub probe_for_frontend: HashMap<String, String>,
    /// Front-end name → name of the file with minimum RTT via that probe.
    pub baseline_for_frontend: HashMap<String, String>,
}

/// Finds the closest probe to each front-end by haversine distance.
///
/// Ties break first-encountered-wins in probe input order, which keeps the
/// whole pipeline deterministic for identical inputs.
pub fn closest_probes(
    frontends: &[FrontEnd],
    probes: &[ProbeClient],
) -> Result<HashMap<String, String>, GeolocationError> {
    if probes.is_empty() {
        return Err(GeolocationError::EmptyEntityList("probes"));
    }

    let mut closest = HashMap::with_capacity(frontends.len());
    for frontend in frontends {
        let mut best: Option<(&ProbeClient, f64)> = None;
        for probe in probes {
            let d = haversine_km(frontend.position(), probe.position);
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((probe, d));
            }
        }
        // probes is non-empty, so best is always set
        let (probe, d) = best.expect("probe list checked non-empty");
        debug!(
            frontend = %frontend.name,
            probe = %probe.name,
            distance_km = d,
            "closest probe"
        );
        closest.insert(frontend.name.clone(), probe.name.clone());
    }
    Ok(closest)
}

/// Finds, per front-end, the file with minimum aggregated RTT via that
/// front-end's closest probe. Ties break first-encountered-wins in file
/// input order.
///
/// The winner is assumed (not proven) co-located with the front-end's
/// datacenter. A front-end with no measurement through its closest probe to
/// any file is a coverage error; there is no sensible default baseline.
pub fn baseline_files(
    dataset: &Dataset,
    probe_for_frontend: &HashMap<String, String>,
) -> Result<HashMap<String, String>, GeolocationError> {
    let mut baselines = HashMap::with_capacity(dataset.frontends.len());

    for frontend in &dataset.frontends {
        let probe = probe_for_frontend
            .get(&frontend.name)
            .expect("closest probe resolved for every front-end");

        let mut best: Option<(&DataFile, f64)> = None;
        for file in &dataset.files {
            let Some(rtt) = dataset.measurements.rtt(probe, &frontend.name, &file.name) else {
                continue;
            };
            if best.map_or(true, |(_, best_rtt)| rtt < best_rtt) {
                best = Some((file, rtt));
            }
        }

        let Some((file, rtt)) = best else {
            return Err(GeolocationError::NoBaseline {
                frontend: frontend.name.clone(),
                probe: probe.clone(),
            });
        };
        debug!(
            frontend = %frontend.name,
            file = %file.name,
            rtt_s = rtt,
            "baseline file"
        );
        baselines.insert(frontend.name.clone(), file.name.clone());
    }

    Ok(baselines)
}

/// Resolves both reference maps for a dataset.
pub fn resolve_references(dataset: &Dataset) -> Result<ClosestRefs, GeolocationError> {
    let probe_for_frontend = closest_probes(&dataset.frontends, &dataset.probes)?;
    let baseline_for_frontend = baseline_files(dataset, &probe_for_frontend)?;
    Ok(ClosestRefs {
        probe_for_frontend,
        baseline_for_frontend,
    })
}

/// Haversine distance in km for every (front-end, file) pair. Requires every
/// file to have a resolved datacenter, i.e. a calibration dataset.
pub fn distance_map(
    dataset: &Dataset,
) -> Result<HashMap<(String, String), f64>, GeolocationError> {
    let mut distances = HashMap::new();
    for frontend in &dataset.frontends {
        for file in &dataset.files {
            let d = haversine_km(frontend.position(), file.position()?);
            distances.insert((frontend.name.clone(), file.name.clone()), d);
        }
    }
    Ok(distances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Continent;
    use crate::geodesy::GeoPoint;
    use crate::measurements::{MeasurementRecord, MIN_SAMPLES};

    fn dc(name: &str, lat: f64, lon: f64) -> Arc<DataCenter> {
        Arc::new(DataCenter::new(
            name,
            GeoPoint::new(lat, lon),
            Continent::Europe,
        ))
    }

    fn probe(name: &str, lat: f64, lon: f64) -> ProbeClient {
        ProbeClient {
            name: name.into(),
            position: GeoPoint::new(lat, lon),
            continent: Continent::Europe,
        }
    }

    fn record(probe: &str, frontend: &str, file: &str, rtt: f64) -> MeasurementRecord {
        MeasurementRecord {
            probe: probe.into(),
            frontend: frontend.into(),
            file: file.into(),
            samples: vec![rtt; MIN_SAMPLES],
        }
    }

    fn small_dataset() -> Dataset {
        let dc_a = dc("dc-a", 0.0, 0.0);
        let dc_b = dc("dc-b", 0.0, 10.0);
        let frontends = vec![
            FrontEnd {
                name: "fe-a".into(),
                datacenter: dc_a.clone(),
            },
            FrontEnd {
                name: "fe-b".into(),
                datacenter: dc_b.clone(),
            },
        ];
        let files = vec![
            DataFile::located("file-a", dc_a.clone()),
            DataFile::located("file-b", dc_b.clone()),
        ];
        let probes = vec![probe("probe-1", 1.0, 0.0), probe("probe-2", 1.0, 10.0)];
        let measurements = MeasurementTable::from_records(&[
            record("probe-1", "fe-a", "file-a", 0.010),
            record("probe-1", "fe-a", "file-b", 0.080),
            record("probe-2", "fe-b", "file-a", 0.090),
            record("probe-2", "fe-b", "file-b", 0.012),
        ])
        .unwrap();

        Dataset::new(
            vec![dc_a.clone(), dc_b.clone()],
            vec![dc_a, dc_b],
            probes,
            frontends,
            files,
            measurements,
        )
        .unwrap()
    }

    #[test]
    fn test_closest_probe_selection() {
        let ds = small_dataset();
        let closest = closest_probes(&ds.frontends, &ds.probes).unwrap();
        assert_eq!(closest["fe-a"], "probe-1");
        assert_eq!(closest["fe-b"], "probe-2");
    }

    #[test]
    fn test_closest_probe_tie_breaks_first() {
        let ds = small_dataset();
        // Both probes equidistant from a front-end on the midline
        let mid = FrontEnd {
            name: "fe-mid".into(),
            datacenter: dc("dc-mid", 0.0, 5.0),
        };
        let closest = closest_probes(&[mid], &ds.probes).unwrap();
        assert_eq!(closest["fe-mid"], "probe-1");
    }

    #[test]
    fn test_baseline_file_selection() {
        let ds = small_dataset();
        let refs = resolve_references(&ds).unwrap();
        assert_eq!(refs.baseline_for_frontend["fe-a"], "file-a");
        assert_eq!(refs.baseline_for_frontend["fe-b"], "file-b");
    }

    #[test]
    fn test_missing_coverage_is_fatal() {
        let mut ds = small_dataset();
        // Remove all measurements through fe-a's closest probe
        ds.measurements = MeasurementTable::from_records(&[
            record("probe-2", "fe-b", "file-a", 0.090),
            record("probe-2", "fe-b", "file-b", 0.012),
        ])
        .unwrap();
        let err = resolve_references(&ds).unwrap_err();
        assert!(matches!(
            err,
            GeolocationError::NoBaseline { frontend, .. } if frontend == "fe-a"
        ));
    }

    #[test]
    fn test_distance_map_symmetric_pairs() {
        let ds = small_dataset();
        let distances = distance_map(&ds).unwrap();
        let d_ab = distances[&("fe-a".to_string(), "file-b".to_string())];
        let d_ba = distances[&("fe-b".to_string(), "file-a".to_string())];
        assert!((d_ab - d_ba).abs() < 1e-9);
        assert!(distances[&("fe-a".to_string(), "file-a".to_string())].abs() < 1e-9);
    }

    #[test]
    fn test_distance_map_requires_resolved_files() {
        let mut ds = small_dataset();
        ds.files.push(DataFile::unlocated("file-x"));
        assert!(matches!(
            distance_map(&ds),
            Err(GeolocationError::UnresolvedFile(name)) if name == "file-x"
        ));
    }
}
