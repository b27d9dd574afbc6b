//! Closed-form solutions from a small number of readings.
//!
//! Positions are found by linear trilateration on distances, either measured
//! or derived from received power through the path loss model. Transmitted
//! power and path loss exponent are then fitted by linear least squares with
//! the position held fixed, and the whole candidate is polished on the same
//! readings with [`refine`](crate::refine::refine).

use crate::{
    config::RefinementConfig,
    error::Error,
    model::{SourceModel, Targets},
    power::{dbm_to_power, distance_from_power},
    reading::Reading,
    refine::{RefineParams, refine},
};
use nalgebra::{DMatrix, DVector, Matrix2, Point, SVector, Vector2};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::trace;
use uom::si::power::milliwatt;

/// Distances are clamped to this value wherever a logarithm or a division
/// by the distance is taken.
pub(crate) const MIN_DISTANCE: f64 = 1e-9;

/// Ratio between the smallest significant and the largest singular value.
const RANK_TOLERANCE: f64 = 1e-10;

/// Formulation of the linear trilateration system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LinearSolver {
    /// Null vector of `[-2 p^T, 1, |p|^2 - d^2]` over `[x, |x|^2, 1]`.
    Homogeneous,

    /// Least squares over the differences against the first reading.
    #[default]
    Inhomogeneous,
}

/// A possible location of the source, with the transmitted power and path
/// loss exponent whenever the model uses received power.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate<const D: usize> {
    pub position: Point<f64, D>,
    pub transmitted_power_dbm: Option<f64>,
    pub path_loss_exponent: Option<f64>,
}

impl<const D: usize> Candidate<D> {
    pub fn from_position(position: Point<f64, D>) -> Self {
        Self {
            position,
            transmitted_power_dbm: None,
            path_loss_exponent: None,
        }
    }
}

/// Inputs of [`solve`] besides the readings.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverParams {
    pub model: SourceModel,
    pub targets: Targets,
    pub linear_solver: LinearSolver,

    /// Transmitted power used to derive distances, or the starting point of
    /// its estimation. Estimated coarsely when absent.
    pub transmitted_power_dbm: Option<f64>,
    pub path_loss_exponent: f64,
    pub refinement: RefinementConfig,
}

/// Solves the source from `readings`.
///
/// Fails with [`Error::ModelUnsolvable`] when the readings are degenerate,
/// for example collinear observers in 2D or repeated positions.
pub fn solve<const D: usize>(
    readings: &[&Reading<D>],
    params: &SolverParams,
) -> Result<Candidate<D>, Error> {
    let model = params.model;
    if readings.len() < model.min_readings::<D>(params.targets) {
        return Err(Error::ModelUnsolvable);
    }

    let ranged: Vec<(Point<f64, D>, f64)> = readings
        .iter()
        .filter_map(|r| Some((*r.position(), model.distance_of(r)?)))
        .collect();

    let mut coarse = false;
    let (position, tx) = match ranged.len() > D {
        true => (
            trilaterate(&ranged, params.linear_solver)?,
            params.transmitted_power_dbm,
        ),
        false => {
            let tx = match params.transmitted_power_dbm {
                Some(tx) => tx,
                None => {
                    coarse = true;
                    coarse_power(readings, model, params.path_loss_exponent)?
                }
            };
            let observations: Vec<(Point<f64, D>, f64)> = readings
                .iter()
                .filter_map(|r| {
                    let distance = model.distance_of(r).or_else(|| {
                        Some(distance_from_power(
                            tx,
                            model.rssi_of(r)?,
                            params.path_loss_exponent,
                        ))
                    })?;
                    Some((*r.position(), distance))
                })
                .collect();
            (trilaterate(&observations, params.linear_solver)?, Some(tx))
        }
    };

    if !model.uses_rssi() {
        return Ok(Candidate::from_position(position));
    }

    let (tx, exponent) = fit_path_loss(
        readings,
        model,
        &position,
        params.targets,
        tx,
        params.path_loss_exponent,
    )?;
    let candidate = Candidate {
        position,
        transmitted_power_dbm: Some(tx),
        path_loss_exponent: Some(exponent),
    };

    if !params.targets.any() && !coarse {
        return Ok(candidate);
    }

    let refine_params = RefineParams {
        model,
        targets: params.targets,
        config: params.refinement.clone(),
        keep_covariance: false,
    };
    match refine(readings, &candidate, &refine_params) {
        Ok(refinement) => Ok(refinement.candidate),
        Err(err) => {
            trace!(%err, "keeping linear candidate");
            Ok(candidate)
        }
    }
}

/// Builds a starting point for refinement over all `readings`.
///
/// Missing guesses are replaced by the output of [`solve`] or, when only the
/// position is known, by a power fit at that position.
pub fn initial_candidate<const D: usize>(
    readings: &[&Reading<D>],
    params: &SolverParams,
    position: Option<Point<f64, D>>,
) -> Result<Candidate<D>, Error> {
    let Some(position) = position else {
        return solve(readings, params);
    };

    if !params.model.uses_rssi() {
        return Ok(Candidate::from_position(position));
    }

    let tx = match params.transmitted_power_dbm {
        Some(tx) => tx,
        None => {
            fit_path_loss(
                readings,
                params.model,
                &position,
                Targets::position_only().with_transmitted_power(true),
                None,
                params.path_loss_exponent,
            )?
            .0
        }
    };

    Ok(Candidate {
        position,
        transmitted_power_dbm: Some(tx),
        path_loss_exponent: Some(params.path_loss_exponent),
    })
}

/// Linear trilateration of `(observer, distance)` pairs.
pub fn trilaterate<const D: usize>(
    observations: &[(Point<f64, D>, f64)],
    solver: LinearSolver,
) -> Result<Point<f64, D>, Error> {
    let n = observations.len();
    if n < D + 1 {
        return Err(Error::ModelUnsolvable);
    }

    // Centre the observers to keep the squared norms well scaled.
    let centroid = observations
        .iter()
        .fold(SVector::<f64, D>::zeros(), |acc, (p, _)| acc + p.coords)
        / n as f64;
    let shifted: Vec<(SVector<f64, D>, f64)> = observations
        .iter()
        .map(|(p, d)| (p.coords - centroid, *d))
        .collect();

    let solution = match solver {
        LinearSolver::Homogeneous => homogeneous(&shifted)?,
        LinearSolver::Inhomogeneous => inhomogeneous(&shifted)?,
    };

    let position = Point::from(solution + centroid);
    match position.coords.iter().all(|v| v.is_finite()) {
        true => Ok(position),
        false => Err(Error::ModelUnsolvable),
    }
}

fn inhomogeneous<const D: usize>(
    observations: &[(SVector<f64, D>, f64)],
) -> Result<SVector<f64, D>, Error> {
    let (p0, d0) = observations[0];
    let rows = observations.len() - 1;
    let mut a = DMatrix::zeros(rows, D);
    let mut b = DVector::zeros(rows);
    for (i, (p, d)) in observations.iter().skip(1).enumerate() {
        let row = 2. * (p - p0);
        for j in 0..D {
            a[(i, j)] = row[j];
        }
        b[i] = d0 * d0 - d * d + p.norm_squared() - p0.norm_squared();
    }

    let svd = a.svd(true, true);
    if !has_rank(&svd.singular_values, D) {
        return Err(Error::ModelUnsolvable);
    }

    let x = svd
        .solve(&b, f64::EPSILON)
        .map_err(|_| Error::ModelUnsolvable)?;
    Ok(SVector::from_fn(|i, _| x[i]))
}

fn homogeneous<const D: usize>(
    observations: &[(SVector<f64, D>, f64)],
) -> Result<SVector<f64, D>, Error> {
    // Pad with zero rows so that the SVD returns the full right basis.
    let cols = D + 2;
    let mut a = DMatrix::zeros(observations.len().max(cols), cols);
    for (i, (p, d)) in observations.iter().enumerate() {
        for j in 0..D {
            a[(i, j)] = -2. * p[j];
        }
        a[(i, D)] = 1.;
        a[(i, D + 1)] = p.norm_squared() - d * d;
    }

    let svd = a.svd(false, true);
    if !has_rank(&svd.singular_values, D + 1) {
        return Err(Error::ModelUnsolvable);
    }

    let v_t = svd.v_t.ok_or(Error::ModelUnsolvable)?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .ok_or(Error::ModelUnsolvable)?;
    let null = v_t.row(smallest);

    let scale = null[D + 1];
    if scale.abs() <= RANK_TOLERANCE * null.norm() {
        return Err(Error::ModelUnsolvable);
    }

    Ok(SVector::from_fn(|i, _| null[i] / scale))
}

fn has_rank(singular_values: &DVector<f64>, rank: usize) -> bool {
    let mut sorted: Vec<f64> = singular_values.iter().copied().collect();
    sorted.sort_by(|a, b| b.total_cmp(a));
    sorted.len() >= rank && sorted[0] > 0. && sorted[rank - 1] > RANK_TOLERANCE * sorted[0]
}

/// Fits the enabled path loss parameters with the source at `position`.
///
/// Parameters that are not in `targets` keep the given values; a fixed
/// transmitted power must therefore be provided. No power reading is needed
/// when nothing is estimated.
fn fit_path_loss<const D: usize>(
    readings: &[&Reading<D>],
    model: SourceModel,
    position: &Point<f64, D>,
    targets: Targets,
    tx: Option<f64>,
    exponent: f64,
) -> Result<(f64, f64), Error> {
    // Pairs of (10 log10 d, received power).
    let samples: Vec<(f64, f64)> = readings
        .iter()
        .filter_map(|r| {
            let rssi = model.rssi_of(r)?;
            let distance = nalgebra::distance(position, r.position()).max(MIN_DISTANCE);
            Some((10. * distance.log10(), rssi))
        })
        .collect();
    if targets.any() && samples.len() < targets.count() {
        return Err(Error::ModelUnsolvable);
    }

    let n = samples.len() as f64;
    let (tx, exponent) = match (targets.transmitted_power, targets.path_loss_exponent) {
        (false, false) => (tx.ok_or(Error::ModelUnsolvable)?, exponent),
        (true, false) => {
            let tx = samples.iter().map(|(l, rssi)| rssi + exponent * l).sum::<f64>() / n;
            (tx, exponent)
        }
        (false, true) => {
            let tx = tx.ok_or(Error::ModelUnsolvable)?;
            let denominator = samples.iter().map(|(l, _)| l * l).sum::<f64>();
            if denominator <= RANK_TOLERANCE {
                return Err(Error::ModelUnsolvable);
            }
            let numerator = samples.iter().map(|(l, rssi)| (tx - rssi) * l).sum::<f64>();
            (tx, numerator / denominator)
        }
        (true, true) => {
            let sum_l = samples.iter().map(|(l, _)| l).sum::<f64>();
            let sum_ll = samples.iter().map(|(l, _)| l * l).sum::<f64>();
            let sum_rssi = samples.iter().map(|(_, rssi)| rssi).sum::<f64>();
            let sum_l_rssi = samples.iter().map(|(l, rssi)| l * rssi).sum::<f64>();

            let normal = Matrix2::new(n, -sum_l, -sum_l, sum_ll);
            if normal.determinant().abs() <= RANK_TOLERANCE * (n * sum_ll).max(1.) {
                return Err(Error::ModelUnsolvable);
            }
            let solution = normal
                .try_inverse()
                .ok_or(Error::ModelUnsolvable)?
                * Vector2::new(sum_rssi, -sum_l_rssi);
            (solution[0], solution[1])
        }
    };

    match tx.is_finite() && exponent.is_finite() && exponent > 0. {
        true => Ok((tx, exponent)),
        false => Err(Error::ModelUnsolvable),
    }
}

/// Transmitted power seen from the power-weighted centroid of the readings.
///
/// Distances shorter than the one metre reference are clamped to it.
fn coarse_power<const D: usize>(
    readings: &[&Reading<D>],
    model: SourceModel,
    exponent: f64,
) -> Result<f64, Error> {
    let (weighted, total) = readings
        .iter()
        .filter_map(|r| Some((r, model.rssi_of(r)?)))
        .fold((SVector::<f64, D>::zeros(), 0.), |(acc, total), (r, rssi)| {
            let weight = dbm_to_power(rssi).get::<milliwatt>();
            (acc + r.position().coords * weight, total + weight)
        });
    if total <= 0. {
        return Err(Error::ModelUnsolvable);
    }

    let centroid = Point::from(weighted / total);
    let (sum, count) = readings
        .iter()
        .filter_map(|r| {
            let rssi = model.rssi_of(r)?;
            let distance = nalgebra::distance(&centroid, r.position()).max(1.);
            Some(rssi + 10. * exponent * distance.log10())
        })
        .fold((0., 0.), |(sum, count), tx| (sum + tx, count + 1.));

    Ok(sum / count)
}
