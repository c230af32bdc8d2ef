// Position solver - multilateration by least-squares optimization
//
// Converts per-front-end one-way delays to distances through the calibrated
// continent-pair rates, then minimizes the squared mismatch between
// haversine distances from a candidate point and the converted distances.
// The search is a damped Gauss-Newton (Levenberg-Marquardt) iteration over
// (lat, lon) with a numeric Jacobian, deliberately unconstrained: the raw
// solution is wrapped back into coordinate range afterward.

use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use tracing::{debug, warn};

use crate::entities::{Continent, FrontEnd};
use crate::error::GeolocationError;
use crate::geodesy::{haversine_km, normalize, GeoPoint};
use crate::rates::RateTable;

/// Minimum anchors for a well-posed 2D multilateration.
pub const MIN_ANCHORS: usize = 3;

/// Iteration cap for the damped least-squares search.
const SOLVER_MAX_ITER: usize = 165;

/// Residual norm (km) below which the solve is accepted outright.
const RESIDUAL_EPSILON: f64 = 1e-6;

/// Progress threshold (km): smaller per-iteration improvement counts as
/// converged on a local minimum.
const PROGRESS_EPSILON: f64 = 1e-9;

/// Finite-difference step in degrees for the numeric Jacobian.
const JACOBIAN_DELTA: f64 = 1e-7;

/// A known front-end position with its delay-derived distance to the target.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub position: GeoPoint,
    pub distance_km: f64,
}

/// Raw optimizer outcome before coordinate wrapping.
#[derive(Debug, Clone, Copy)]
pub struct SolverResult {
    pub position: GeoPoint,
    pub converged: bool,
    pub iterations: usize,
}

/// A finished position estimate for one target.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub position: GeoPoint,
    pub converged: bool,
    pub assumed_continent: Continent,
    pub anchors_used: usize,
}

fn residuals(p: GeoPoint, anchors: &[Anchor]) -> DVector<f64> {
    DVector::from_iterator(
        anchors.len(),
        anchors
            .iter()
            .map(|a| haversine_km(p, a.position) - a.distance_km),
    )
}

fn jacobian(p: GeoPoint, anchors: &[Anchor], base: &DVector<f64>) -> DMatrix<f64> {
    let mut jac = DMatrix::zeros(anchors.len(), 2);
    for (col, shifted) in [
        GeoPoint::new(p.lat + JACOBIAN_DELTA, p.lon),
        GeoPoint::new(p.lat, p.lon + JACOBIAN_DELTA),
    ]
    .into_iter()
    .enumerate()
    {
        let shifted_res = residuals(shifted, anchors);
        for row in 0..anchors.len() {
            jac[(row, col)] = (shifted_res[row] - base[row]) / JACOBIAN_DELTA;
        }
    }
    jac
}

/// Minimizes Σ (haversine(p, anchor) − distance)² from the given seed.
///
/// Always returns the best iterate; `converged` reports whether the search
/// actually settled, and callers surface a non-converged result as a
/// warning rather than discarding it.
pub fn multilaterate(anchors: &[Anchor], seed: GeoPoint) -> SolverResult {
    let mut p = seed;
    let mut lambda = 0.1;
    let mut prev_norm = f64::INFINITY;

    for iter in 0..SOLVER_MAX_ITER {
        let res = residuals(p, anchors);
        let norm = res.norm();

        if norm < RESIDUAL_EPSILON {
            return SolverResult {
                position: p,
                converged: true,
                iterations: iter,
            };
        }
        if iter > 0 && (prev_norm - norm).abs() < PROGRESS_EPSILON {
            return SolverResult {
                position: p,
                converged: true,
                iterations: iter,
            };
        }

        let jac = jacobian(p, anchors, &res);
        let jt = jac.transpose();
        let jtj_full = &jt * &jac;
        let jtr_full = &jt * &res;
        let jtj = Matrix2::new(
            jtj_full[(0, 0)],
            jtj_full[(0, 1)],
            jtj_full[(1, 0)],
            jtj_full[(1, 1)],
        );
        let jtr = Vector2::new(jtr_full[0], jtr_full[1]);

        // Damped normal equations: (JᵀJ + λI) Δ = -Jᵀr. A rejected step
        // raises the damping and retries; runaway damping means no further
        // progress is possible from here.
        let mut stepped = false;
        for _ in 0..10 {
            let damped = jtj + Matrix2::identity() * lambda;
            let Some(inv) = damped.try_inverse() else {
                lambda *= 10.0;
                if lambda > 1e10 {
                    return SolverResult {
                        position: p,
                        converged: false,
                        iterations: iter,
                    };
                }
                continue;
            };

            let step = inv * (-jtr);
            let candidate = GeoPoint::new(p.lat + step[0], p.lon + step[1]);
            if residuals(candidate, anchors).norm() < norm {
                p = candidate;
                lambda = (lambda * 0.1).max(1e-10);
                stepped = true;
                break;
            }
            lambda *= 10.0;
            if lambda > 1e10 {
                return SolverResult {
                    position: p,
                    converged: false,
                    iterations: iter,
                };
            }
        }

        if !stepped {
            return SolverResult {
                position: p,
                converged: false,
                iterations: iter,
            };
        }
        prev_norm = norm;
    }

    SolverResult {
        position: p,
        converged: false,
        iterations: SOLVER_MAX_ITER,
    }
}

/// Full multilateration pipeline for one target: delay vector → distances →
/// seeded solve → wrapped coordinate.
///
/// The target's continent is assumed to be that of the front-end reporting
/// the minimum delay; that assumption selects the rate cell for every
/// conversion. Front-ends whose rate cell is degenerate are dropped from the
/// anchor set. Fewer than [`MIN_ANCHORS`] usable anchors is an error scoped
/// to this target.
pub fn geolocate_target(
    target: &str,
    delays: &[(&FrontEnd, f64)],
    rates: &RateTable,
) -> Result<Estimate, GeolocationError> {
    let Some(&(closest_frontend, _)) = delays
        .iter()
        .reduce(|best, item| if item.1 < best.1 { item } else { best })
    else {
        return Err(GeolocationError::UnderDetermined {
            target: target.to_string(),
            usable: 0,
            minimum: MIN_ANCHORS,
        });
    };
    let assumed_continent = closest_frontend.continent();

    let mut anchors = Vec::with_capacity(delays.len());
    for &(frontend, delay) in delays {
        match rates.delay_to_distance(delay, frontend.continent(), assumed_continent) {
            Some(distance_km) => anchors.push(Anchor {
                position: frontend.position(),
                distance_km,
            }),
            None => debug!(
                target,
                frontend = %frontend.name,
                "degenerate rate cell, dropping anchor"
            ),
        }
    }

    if anchors.len() < MIN_ANCHORS {
        return Err(GeolocationError::UnderDetermined {
            target: target.to_string(),
            usable: anchors.len(),
            minimum: MIN_ANCHORS,
        });
    }

    // Seed at the anchor with minimum converted distance. Seeding at the
    // centroid drives solutions toward coordinate boundary artifacts.
    let seed = anchors
        .iter()
        .reduce(|best, a| if a.distance_km < best.distance_km { a } else { best })
        .expect("anchor set checked non-empty")
        .position;

    let result = multilaterate(&anchors, seed);
    if !result.converged {
        warn!(
            target,
            iterations = result.iterations,
            "position solver did not converge, keeping best iterate"
        );
    }

    Ok(Estimate {
        position: normalize(result.position),
        converged: result.converged,
        assumed_continent,
        anchors_used: anchors.len(),
    })
}
