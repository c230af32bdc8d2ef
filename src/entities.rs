// Entity model - datacenters, probe clients, front-ends and data files
//
// All entities are built once from the input configuration and shared
// immutably for the rest of the run. Front-ends and files reference their
// datacenter rather than duplicating its coordinates.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GeolocationError;
use crate::geodesy::GeoPoint;

/// Coarse proxy for backbone transmission characteristics. The rate
/// calibrator fits one transmission rate per ordered continent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Continent {
    #[serde(rename = "Asia")]
    Asia,
    #[serde(rename = "Europe")]
    Europe,
    #[serde(rename = "N. America")]
    NorthAmerica,
    #[serde(rename = "S. America")]
    SouthAmerica,
    #[serde(rename = "Australia")]
    Australia,
}

impl Continent {
    /// All continents, in a fixed order used for rate-matrix iteration.
    pub const ALL: [Continent; 5] = [
        Continent::Asia,
        Continent::Europe,
        Continent::NorthAmerica,
        Continent::SouthAmerica,
        Continent::Australia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Continent::Asia => "Asia",
            Continent::Europe => "Europe",
            Continent::NorthAmerica => "N. America",
            Continent::SouthAmerica => "S. America",
            Continent::Australia => "Australia",
        }
    }
}

impl fmt::Display for Continent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Continent {
    type Err = GeolocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Asia" => Ok(Continent::Asia),
            "Europe" => Ok(Continent::Europe),
            "N. America" => Ok(Continent::NorthAmerica),
            "S. America" => Ok(Continent::SouthAmerica),
            "Australia" => Ok(Continent::Australia),
            other => Err(GeolocationError::UnknownContinent(other.to_string())),
        }
    }
}

/// A physical datacenter with a known location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataCenter {
    pub name: String,
    pub position: GeoPoint,
    pub continent: Continent,
}

impl DataCenter {
    pub fn new(name: impl Into<String>, position: GeoPoint, continent: Continent) -> Self {
        DataCenter {
            name: name.into(),
            position,
            continent,
        }
    }
}

/// A fixed vantage point that issued RTT probes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeClient {
    pub name: String,
    pub position: GeoPoint,
    pub continent: Continent,
}

/// A reachable server in a known datacenter. Location and continent are
/// derived from the owning datacenter.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontEnd {
    pub name: String,
    pub datacenter: Arc<DataCenter>,
}

impl FrontEnd {
    pub fn position(&self) -> GeoPoint {
        self.datacenter.position
    }

    pub fn continent(&self) -> Continent {
        self.datacenter.continent
    }
}

/// A stored object whose location is known in calibration datasets and
/// unknown in target datasets.
///
/// Position and continent accessors fail explicitly when the datacenter is
/// unresolved; there is no default location to fall back to.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFile {
    pub name: String,
    pub datacenter: Option<Arc<DataCenter>>,
}

impl DataFile {
    pub fn located(name: impl Into<String>, datacenter: Arc<DataCenter>) -> Self {
        DataFile {
            name: name.into(),
            datacenter: Some(datacenter),
        }
    }

    pub fn unlocated(name: impl Into<String>) -> Self {
        DataFile {
            name: name.into(),
            datacenter: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.datacenter.is_some()
    }

    pub fn position(&self) -> Result<GeoPoint, GeolocationError> {
        self.datacenter
            .as_ref()
            .map(|dc| dc.position)
            .ok_or_else(|| GeolocationError::UnresolvedFile(self.name.clone()))
    }

    pub fn continent(&self) -> Result<Continent, GeolocationError> {
        self.datacenter
            .as_ref()
            .map(|dc| dc.continent)
            .ok_or_else(|| GeolocationError::UnresolvedFile(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datacenter() -> Arc<DataCenter> {
        Arc::new(DataCenter::new(
            "dc-tokyo",
            GeoPoint::new(35.6893, 139.6899),
            Continent::Asia,
        ))
    }

    #[test]
    fn test_continent_round_trip() {
        for c in Continent::ALL {
            assert_eq!(c.as_str().parse::<Continent>().unwrap(), c);
        }
    }

    #[test]
    fn test_continent_unknown() {
        assert!("Atlantis".parse::<Continent>().is_err());
    }

    #[test]
    fn test_frontend_delegates_to_datacenter() {
        let dc = datacenter();
        let fe = FrontEnd {
            name: "fe-01".into(),
            datacenter: dc.clone(),
        };
        assert_eq!(fe.position(), dc.position);
        assert_eq!(fe.continent(), Continent::Asia);
    }

    #[test]
    fn test_unresolved_file_access_fails() {
        let file = DataFile::unlocated("file-09");
        assert!(!file.is_resolved());
        assert!(matches!(
            file.position(),
            Err(GeolocationError::UnresolvedFile(name)) if name == "file-09"
        ));
        assert!(file.continent().is_err());
    }

    #[test]
    fn test_located_file_access() {
        let file = DataFile::located("file-01", datacenter());
        assert!(file.is_resolved());
        assert_eq!(file.continent().unwrap(), Continent::Asia);
    }
}
