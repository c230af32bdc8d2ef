// Measurement table - aggregated RTTs keyed by (probe, frontend, file)

use std::collections::{HashMap, HashSet};

use crate::entities::{DataFile, FrontEnd, ProbeClient};
use crate::error::GeolocationError;

/// Samples dropped from each end of a sorted row before averaging.
pub const TRIM_PER_SIDE: usize = 3;

/// Minimum raw samples per row: trim three from each side, keep at least one.
pub const MIN_SAMPLES: usize = 2 * TRIM_PER_SIDE + 1;

/// One raw input row: repeated RTT samples for a single probe path.
#[derive(Debug, Clone)]
pub struct MeasurementRecord {
    pub probe: String,
    pub frontend: String,
    pub file: String,
    pub samples: Vec<f64>,
}

/// Collapses repeated samples into one RTT by discarding the three lowest
/// and three highest and averaging the remainder. Trimming both tails damps
/// transient spikes without the optimistic bias of taking the minimum.
pub fn aggregate_samples(samples: &[f64]) -> Result<f64, GeolocationError> {
    if samples.len() < MIN_SAMPLES {
        return Err(GeolocationError::TooFewSamples {
            got: samples.len(),
            minimum: MIN_SAMPLES,
        });
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let kept = &sorted[TRIM_PER_SIDE..sorted.len() - TRIM_PER_SIDE];
    Ok(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Aggregated RTT per (probe, frontend, file), in seconds.
///
/// Built once from the raw rows and read-only afterward.
#[derive(Debug, Clone, Default)]
pub struct MeasurementTable {
    rtts: HashMap<(String, String, String), f64>,
}

impl MeasurementTable {
    pub fn from_records(records: &[MeasurementRecord]) -> Result<Self, GeolocationError> {
        let mut rtts = HashMap::with_capacity(records.len());
        for record in records {
            let rtt = aggregate_samples(&record.samples)?;
            rtts.insert(
                (
                    record.probe.clone(),
                    record.frontend.clone(),
                    record.file.clone(),
                ),
                rtt,
            );
        }
        Ok(MeasurementTable { rtts })
    }

    /// Aggregated round-trip time in seconds, if the path was measured.
    pub fn rtt(&self, probe: &str, frontend: &str, file: &str) -> Option<f64> {
        self.rtts
            .get(&(probe.to_string(), frontend.to_string(), file.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.rtts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rtts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, String, String), f64)> {
        self.rtts.iter().map(|(k, v)| (k, *v))
    }

    /// Checks the table against the declared entities: the three name spaces
    /// must be disjoint, and every key component must be declared.
    pub fn validate(
        &self,
        probes: &[ProbeClient],
        frontends: &[FrontEnd],
        files: &[DataFile],
    ) -> Result<(), GeolocationError> {
        let probe_names: HashSet<&str> = probes.iter().map(|p| p.name.as_str()).collect();
        let frontend_names: HashSet<&str> = frontends.iter().map(|f| f.name.as_str()).collect();
        let file_names: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();

        let collision = probe_names
            .intersection(&frontend_names)
            .chain(probe_names.intersection(&file_names))
            .chain(frontend_names.intersection(&file_names))
            .next();
        if let Some(name) = collision {
            return Err(GeolocationError::NameCollision((*name).to_string()));
        }

        for (probe, frontend, file) in self.rtts.keys() {
            if !probe_names.contains(probe.as_str()) {
                return Err(GeolocationError::UnknownEntity {
                    kind: "probe",
                    name: probe.clone(),
                });
            }
            if !frontend_names.contains(frontend.as_str()) {
                return Err(GeolocationError::UnknownEntity {
                    kind: "front-end",
                    name: frontend.clone(),
                });
            }
            if !file_names.contains(file.as_str()) {
                return Err(GeolocationError::UnknownEntity {
                    kind: "file",
                    name: file.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Continent, DataCenter};
    use crate::geodesy::GeoPoint;
    use std::sync::Arc;

    #[test]
    fn test_aggregate_trims_extremes() {
        // 3 low outliers, 3 high outliers, 4 plateau values
        let samples = [0.001, 0.002, 0.003, 0.05, 0.05, 0.05, 0.05, 9.0, 9.5, 10.0];
        let rtt = aggregate_samples(&samples).unwrap();
        assert!((rtt - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_unsorted_input() {
        let samples = [10.0, 0.05, 0.001, 9.5, 0.05, 0.002, 0.05, 0.003, 9.0, 0.05];
        let rtt = aggregate_samples(&samples).unwrap();
        assert!((rtt - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_rejects_short_rows() {
        let samples = [0.05; 6];
        assert!(matches!(
            aggregate_samples(&samples),
            Err(GeolocationError::TooFewSamples { got: 6, minimum: 7 })
        ));
    }

    #[test]
    fn test_aggregate_minimum_row() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let rtt = aggregate_samples(&samples).unwrap();
        assert!((rtt - 4.0).abs() < 1e-12);
    }

    fn record(probe: &str, frontend: &str, file: &str, rtt: f64) -> MeasurementRecord {
        MeasurementRecord {
            probe: probe.into(),
            frontend: frontend.into(),
            file: file.into(),
            samples: vec![rtt; MIN_SAMPLES],
        }
    }

    #[test]
    fn test_table_lookup() {
        let table =
            MeasurementTable::from_records(&[record("probe-01", "fe-01", "file-01", 0.12)])
                .unwrap();
        assert_eq!(table.len(), 1);
        assert!((table.rtt("probe-01", "fe-01", "file-01").unwrap() - 0.12).abs() < 1e-12);
        assert!(table.rtt("probe-01", "fe-01", "file-02").is_none());
    }

    #[test]
    fn test_validate_disjoint_names() {
        let dc = Arc::new(DataCenter::new(
            "dc-01",
            GeoPoint::new(0.0, 0.0),
            Continent::Europe,
        ));
        let probes = vec![ProbeClient {
            name: "shared".into(),
            position: GeoPoint::new(1.0, 1.0),
            continent: Continent::Europe,
        }];
        let frontends = vec![FrontEnd {
            name: "shared".into(),
            datacenter: dc.clone(),
        }];
        let files = vec![DataFile::located("file-01", dc)];

        let table = MeasurementTable::default();
        assert!(matches!(
            table.validate(&probes, &frontends, &files),
            Err(GeolocationError::NameCollision(name)) if name == "shared"
        ));
    }

    #[test]
    fn test_validate_unknown_entity() {
        let dc = Arc::new(DataCenter::new(
            "dc-01",
            GeoPoint::new(0.0, 0.0),
            Continent::Europe,
        ));
        let probes = vec![ProbeClient {
            name: "probe-01".into(),
            position: GeoPoint::new(1.0, 1.0),
            continent: Continent::Europe,
        }];
        let frontends = vec![FrontEnd {
            name: "fe-01".into(),
            datacenter: dc.clone(),
        }];
        let files = vec![DataFile::located("file-01", dc)];

        let table =
            MeasurementTable::from_records(&[record("probe-99", "fe-01", "file-01", 0.1)])
                .unwrap();
        assert!(matches!(
            table.validate(&probes, &frontends, &files),
            Err(GeolocationError::UnknownEntity { kind: "probe", .. })
        ));
    }
}
