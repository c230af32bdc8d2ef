// Error taxonomy for the geolocation pipeline

use thiserror::Error;

/// Errors raised while building datasets, extracting delays, calibrating
/// rates or solving for target positions.
///
/// Per-target failures (`UnderDetermined`, `NoCandidate`) are isolated by the
/// pipeline: the affected target is skipped and the batch continues. The
/// remaining variants abort the run.
#[derive(Debug, Error)]
pub enum GeolocationError {
    /// A required (probe, frontend, file) combination is absent from the
    /// measurement table.
    #[error("no measurement for probe {probe} via front-end {frontend} to file {file}")]
    MissingMeasurement {
        probe: String,
        frontend: String,
        file: String,
    },

    /// A front-end has no measurement through its closest probe to any file,
    /// so no baseline file can be chosen for it.
    #[error("front-end {frontend} has no measurements via its closest probe {probe}")]
    NoBaseline { frontend: String, probe: String },

    /// A file whose datacenter is unknown was used in a context that needs
    /// its coordinates or continent.
    #[error("file {0} is not mapped to a datacenter")]
    UnresolvedFile(String),

    /// The calibration and target datasets resolved different closest probes
    /// for the same datacenter.
    #[error(
        "datacenter {datacenter}: closest probe differs between datasets \
         (calibration {calibration}, target {target})"
    )]
    ClosestProbeMismatch {
        datacenter: String,
        calibration: String,
        target: String,
    },

    /// A target front-end has no calibration front-end in the same
    /// datacenter to anchor against.
    #[error("no calibration front-end shares a datacenter with {frontend}")]
    NoCalibrationTwin { frontend: String },

    /// Fewer usable anchors than multilateration needs. Fatal for the
    /// affected target only.
    #[error("target {target}: {usable} usable front-end distances, multilateration needs {minimum}")]
    UnderDetermined {
        target: String,
        usable: usize,
        minimum: usize,
    },

    /// No candidate datacenter shares enough fingerprint dimensions with the
    /// target's feature vector. Fatal for the affected target only.
    #[error("no candidate datacenter matches the delay profile of target {0}")]
    NoCandidate(String),

    /// Probe, front-end and file identifiers must live in disjoint name
    /// spaces.
    #[error("entity name {0} is declared in more than one role")]
    NameCollision(String),

    /// A measurement row references an entity that was never declared.
    #[error("measurement references unknown {kind} {name}")]
    UnknownEntity { kind: &'static str, name: String },

    /// Not enough raw samples to trim the extremes and keep a remainder.
    #[error("measurement row has {got} samples, need at least {minimum}")]
    TooFewSamples { got: usize, minimum: usize },

    /// A dataset declares none of a required entity kind.
    #[error("dataset declares no {0}")]
    EmptyEntityList(&'static str),

    /// A continent name outside the known set.
    #[error("unknown continent {0:?}")]
    UnknownContinent(String),

    /// An input file is missing or structurally unusable.
    #[error("{file}: {reason}")]
    InvalidInput { file: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
