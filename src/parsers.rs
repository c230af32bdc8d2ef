// Input parsing - CSV-shaped dataset files
//
// Thin layer with no algorithmic content: it turns the input directory into
// typed entities and raw measurement rows. Malformed rows are skipped with
// a warning; missing required files and dangling references are fatal.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::entities::{Continent, DataCenter, DataFile, FrontEnd, ProbeClient};
use crate::error::GeolocationError;
use crate::geodesy::GeoPoint;
use crate::measurements::{MeasurementRecord, MeasurementTable, MIN_SAMPLES};

pub const DATACENTERS_FILE: &str = "datacenters.csv";
pub const SERVERS_FILE_CALIBRATION: &str = "servers-1party.csv";
pub const MEASUREMENTS_FILE_CALIBRATION: &str = "measurements-1party.csv";
pub const SERVERS_FILE_TARGET: &str = "servers-3party.csv";
pub const MEASUREMENTS_FILE_TARGET: &str = "measurements-3party.csv";
pub const SOLUTION_FILE: &str = "solution.csv";

/// Marker in the optional fifth datacenter column: calibrate with this
/// datacenter but never offer it as a target candidate.
const LEARN_ONLY: &str = "learn_only";

/// Reads a CSV-ish file into rows of trimmed, non-empty fields. Blank lines
/// vanish entirely.
fn read_rows(path: &Path) -> Result<Vec<Vec<String>>, GeolocationError> {
    let content = fs::read_to_string(path).map_err(|e| GeolocationError::InvalidInput {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;

    Ok(content
        .lines()
        .map(|line| {
            line.split(',')
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect())
}

/// Parses `datacenters.csv`: `name,lat,lon,continent[,learn_only]`.
///
/// Returns all datacenters plus the subset usable as target candidates.
pub fn parse_datacenters(
    dir: &Path,
) -> Result<(Vec<Arc<DataCenter>>, Vec<Arc<DataCenter>>), GeolocationError> {
    let path = dir.join(DATACENTERS_FILE);
    let mut datacenters = Vec::new();
    let mut candidates = Vec::new();

    for row in read_rows(&path)? {
        let ok = matches!(row.len(), 4 | 5) && (row.len() == 4 || row[4] == LEARN_ONLY);
        if !ok {
            warn!(file = DATACENTERS_FILE, ?row, "skipping invalid row");
            continue;
        }

        let (Ok(lat), Ok(lon), Ok(continent)) = (
            row[1].parse::<f64>(),
            row[2].parse::<f64>(),
            row[3].parse::<Continent>(),
        ) else {
            warn!(file = DATACENTERS_FILE, ?row, "skipping invalid row");
            continue;
        };

        let datacenter = Arc::new(DataCenter::new(
            row[0].clone(),
            GeoPoint::new(lat, lon),
            continent,
        ));
        if row.len() == 4 {
            candidates.push(datacenter.clone());
        }
        datacenters.push(datacenter);
    }

    if datacenters.is_empty() {
        return Err(GeolocationError::InvalidInput {
            file: path.display().to_string(),
            reason: "no datacenters declared".into(),
        });
    }
    Ok((datacenters, candidates))
}

fn find_datacenter(
    datacenters: &[Arc<DataCenter>],
    name: &str,
    file: &str,
) -> Result<Arc<DataCenter>, GeolocationError> {
    datacenters
        .iter()
        .find(|dc| dc.name == name)
        .cloned()
        .ok_or_else(|| GeolocationError::InvalidInput {
            file: file.to_string(),
            reason: format!("unknown datacenter {name}"),
        })
}

/// Parses a servers file with typed rows:
/// `probe,name,lat,lon,continent` / `frontend,name,datacenter` /
/// `file,name,datacenter` (calibration) or `file,name` (target).
pub fn parse_servers(
    dir: &Path,
    file_name: &str,
    datacenters: &[Arc<DataCenter>],
    files_located: bool,
) -> Result<(Vec<ProbeClient>, Vec<FrontEnd>, Vec<DataFile>), GeolocationError> {
    let path = dir.join(file_name);
    let mut probes = Vec::new();
    let mut frontends = Vec::new();
    let mut files = Vec::new();

    for row in read_rows(&path)? {
        match (row[0].as_str(), row.len()) {
            ("probe", 5) => {
                let (Ok(lat), Ok(lon), Ok(continent)) = (
                    row[2].parse::<f64>(),
                    row[3].parse::<f64>(),
                    row[4].parse::<Continent>(),
                ) else {
                    warn!(file = file_name, ?row, "skipping invalid row");
                    continue;
                };
                probes.push(ProbeClient {
                    name: row[1].clone(),
                    position: GeoPoint::new(lat, lon),
                    continent,
                });
            }
            ("frontend", 3) => {
                let datacenter = find_datacenter(datacenters, &row[2], file_name)?;
                frontends.push(FrontEnd {
                    name: row[1].clone(),
                    datacenter,
                });
            }
            ("file", 3) if files_located => {
                let datacenter = find_datacenter(datacenters, &row[2], file_name)?;
                files.push(DataFile::located(row[1].clone(), datacenter));
            }
            ("file", 2) if !files_located => {
                files.push(DataFile::unlocated(row[1].clone()));
            }
            _ => warn!(file = file_name, ?row, "skipping invalid row"),
        }
    }

    Ok((probes, frontends, files))
}

/// Parses a measurements file: `probe,frontend,file,s1,...,sN` raw RTT
/// sample rows in seconds.
pub fn parse_measurements(
    dir: &Path,
    file_name: &str,
) -> Result<Vec<MeasurementRecord>, GeolocationError> {
    let path = dir.join(file_name);
    let mut records = Vec::new();

    for row in read_rows(&path)? {
        if row.len() < 3 + MIN_SAMPLES {
            warn!(file = file_name, ?row, "skipping incomplete row");
            continue;
        }
        let samples: Result<Vec<f64>, _> = row[3..].iter().map(|s| s.parse::<f64>()).collect();
        let Ok(samples) = samples else {
            warn!(file = file_name, ?row, "skipping row with unparsable sample");
            continue;
        };
        records.push(MeasurementRecord {
            probe: row[0].clone(),
            frontend: row[1].clone(),
            file: row[2].clone(),
            samples,
        });
    }

    if records.is_empty() {
        return Err(GeolocationError::InvalidInput {
            file: path.display().to_string(),
            reason: "no usable measurement rows".into(),
        });
    }
    Ok(records)
}

/// Parses `solution.csv` ground truth: `file,datacenter` rows. Rows naming
/// unknown files or datacenters are skipped with a warning.
pub fn parse_solution(
    dir: &Path,
    files: &[DataFile],
    datacenters: &[Arc<DataCenter>],
) -> Result<HashMap<String, String>, GeolocationError> {
    let path = dir.join(SOLUTION_FILE);
    let mut solution = HashMap::new();

    for row in read_rows(&path)? {
        if row.len() != 2 {
            warn!(file = SOLUTION_FILE, ?row, "skipping incomplete row");
            continue;
        }
        if !files.iter().any(|f| f.name == row[0]) {
            warn!(file = SOLUTION_FILE, name = %row[0], "unknown file, skipping");
            continue;
        }
        if !datacenters.iter().any(|dc| dc.name == row[1]) {
            warn!(
                file = SOLUTION_FILE,
                name = %row[1],
                "unknown datacenter, skipping"
            );
            continue;
        }
        solution.insert(row[0].clone(), row[1].clone());
    }

    Ok(solution)
}

/// Loads the calibration ("1-party") dataset. All of its files are required.
pub fn load_calibration_dataset(dir: &Path) -> Result<Dataset, GeolocationError> {
    for required in [
        DATACENTERS_FILE,
        SERVERS_FILE_CALIBRATION,
        MEASUREMENTS_FILE_CALIBRATION,
    ] {
        if !dir.join(required).is_file() {
            return Err(GeolocationError::InvalidInput {
                file: required.to_string(),
                reason: "required input file missing".into(),
            });
        }
    }

    let (datacenters, candidates) = parse_datacenters(dir)?;
    let (probes, frontends, files) =
        parse_servers(dir, SERVERS_FILE_CALIBRATION, &datacenters, true)?;
    let records = parse_measurements(dir, MEASUREMENTS_FILE_CALIBRATION)?;
    let measurements = MeasurementTable::from_records(&records)?;

    info!(
        datacenters = datacenters.len(),
        probes = probes.len(),
        frontends = frontends.len(),
        files = files.len(),
        measurements = measurements.len(),
        "loaded calibration dataset"
    );

    Dataset::new(
        datacenters,
        candidates,
        probes,
        frontends,
        files,
        measurements,
    )
}

/// Loads the target ("3-party") dataset when its file pair is present.
/// Shares the calibration run's datacenters and candidate set.
pub fn load_target_dataset(
    dir: &Path,
    calibration: &Dataset,
) -> Result<Option<Dataset>, GeolocationError> {
    if !dir.join(SERVERS_FILE_TARGET).is_file() || !dir.join(MEASUREMENTS_FILE_TARGET).is_file() {
        return Ok(None);
    }

    let (probes, frontends, files) =
        parse_servers(dir, SERVERS_FILE_TARGET, &calibration.datacenters, false)?;
    let records = parse_measurements(dir, MEASUREMENTS_FILE_TARGET)?;
    let measurements = MeasurementTable::from_records(&records)?;

    info!(
        probes = probes.len(),
        frontends = frontends.len(),
        files = files.len(),
        measurements = measurements.len(),
        "loaded target dataset"
    );

    Dataset::new(
        calibration.datacenters.clone(),
        calibration.candidate_datacenters.clone(),
        probes,
        frontends,
        files,
        measurements,
    )
    .map(Some)
}

/// Loads the ground-truth solution if present.
pub fn load_solution(
    dir: &Path,
    target: &Dataset,
) -> Result<Option<HashMap<String, String>>, GeolocationError> {
    if !dir.join(SOLUTION_FILE).is_file() {
        return Ok(None);
    }
    parse_solution(dir, &target.files, &target.datacenters).map(Some)
}
