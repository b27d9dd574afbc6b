//! Weighted nonlinear least squares refinement.
//!
//! The residual of a reading is the observed minus the predicted value of
//! each channel the model consumes:
//!
//! ```text
//! r_d = d - |x - p|
//! r_p = P - (P_tx - 10 n log10 |x - p|)
//! ```
//!
//! Each residual is weighted by the inverse of its variance. When the
//! observer position carries a covariance `S`, `g^T S g` is added to that
//! variance, where `g` is the gradient of the predicted value with respect
//! to the observer position.

use crate::{
    config::RefinementConfig,
    error::Error,
    model::{SourceModel, Targets},
    power::{DEFAULT_PATH_LOSS_EXPONENT, received_power_dbm},
    reading::Reading,
    solver::{Candidate, MIN_DISTANCE},
};
use nalgebra::{DMatrix, DVector, Point, SVector};
use std::f64::consts::LN_10;
use tracing::debug;

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e12;
const STEP_TOLERANCE: f64 = 1e-12;
const GRADIENT_TOLERANCE: f64 = 1e-14;

/// Inputs of [`refine`] besides the readings and the starting point.
#[derive(Clone, Debug, PartialEq)]
pub struct RefineParams {
    pub model: SourceModel,
    pub targets: Targets,
    pub config: RefinementConfig,
    pub keep_covariance: bool,
}

/// Output of [`refine`].
#[derive(Clone, Debug, PartialEq)]
pub struct Refinement<const D: usize> {
    pub candidate: Candidate<D>,

    /// Covariance of the estimated parameters: position coordinates, then
    /// transmitted power and path loss exponent when they are targets.
    pub covariance: Option<DMatrix<f64>>,
    pub iterations: usize,

    /// Weighted sum of squared residuals at the solution.
    pub cost: f64,
}

/// Refines `initial` over `readings` with Levenberg-Marquardt.
///
/// The position is always refined. Transmitted power and path loss exponent
/// are refined when they are targets and held at their initial value
/// otherwise.
pub fn refine<const D: usize>(
    readings: &[&Reading<D>],
    initial: &Candidate<D>,
    params: &RefineParams,
) -> Result<Refinement<D>, Error> {
    let problem = Problem::new(readings, initial, params)?;
    if problem.residual_count() < problem.parameter_count() {
        return Err(Error::RefinementFailed("fewer residuals than parameters"));
    }

    let mut theta = problem.pack(initial);
    let mut linearization = problem.linearize(&theta);
    let mut cost = linearization.cost();
    if !cost.is_finite() {
        return Err(Error::RefinementFailed("initial residuals are not finite"));
    }

    let mut damping = INITIAL_DAMPING;
    let mut converged = false;
    let mut iterations = 0;
    while iterations < params.config.max_iterations {
        iterations += 1;

        let (normal, gradient) = linearization.normal_equations();
        if gradient.amax() <= GRADIENT_TOLERANCE {
            converged = true;
            break;
        }

        let mut damped = normal.clone();
        for i in 0..damped.nrows() {
            damped[(i, i)] += damping * normal[(i, i)].max(MIN_DAMPING);
        }

        let Some(cholesky) = damped.cholesky() else {
            damping *= 10.;
            if damping > MAX_DAMPING {
                break;
            }
            continue;
        };
        let step = cholesky.solve(&(-gradient));
        let next_theta = &theta + &step;
        let next_linearization = problem.linearize(&next_theta);
        let next_cost = next_linearization.cost();

        if next_cost.is_finite() && next_cost < cost {
            theta = next_theta;
            linearization = next_linearization;
            cost = next_cost;
            damping = (damping / 10.).max(MIN_DAMPING);

            if step.norm() <= STEP_TOLERANCE * (theta.norm() + STEP_TOLERANCE) {
                converged = true;
                break;
            }
        } else {
            // No damping reduces the cost any further: a local minimum.
            damping *= 10.;
            if damping > MAX_DAMPING {
                converged = true;
                break;
            }
        }
    }

    if !converged {
        return Err(Error::RefinementFailed("iteration limit reached"));
    }
    if theta.iter().any(|v| !v.is_finite()) {
        return Err(Error::RefinementFailed("parameters are not finite"));
    }

    let covariance = match params.keep_covariance {
        true => Some(
            linearization
                .normal_equations()
                .0
                .cholesky()
                .ok_or(Error::RefinementFailed(
                    "normal equations are not positive definite",
                ))?
                .inverse(),
        ),
        false => None,
    };

    debug!(iterations, cost, "refinement converged");
    Ok(Refinement {
        candidate: problem.unpack(&theta),
        covariance,
        iterations,
        cost,
    })
}

struct Problem<'r, const D: usize> {
    readings: &'r [&'r Reading<D>],
    model: SourceModel,
    targets: Targets,
    config: &'r RefinementConfig,

    /// Values used for the power model parameters that are not targets.
    tx: f64,
    exponent: f64,
}

struct Linearization {
    residuals: DVector<f64>,
    jacobian: DMatrix<f64>,
    weights: DVector<f64>,
}

impl<'r, const D: usize> Problem<'r, D> {
    fn new(
        readings: &'r [&'r Reading<D>],
        initial: &Candidate<D>,
        params: &'r RefineParams,
    ) -> Result<Self, Error> {
        let tx = match (params.model.uses_rssi(), initial.transmitted_power_dbm) {
            (true, None) => {
                return Err(Error::RefinementFailed("missing transmitted power"));
            }
            (_, tx) => tx.unwrap_or_default(),
        };

        Ok(Self {
            readings,
            model: params.model,
            targets: params.targets,
            config: &params.config,
            tx,
            exponent: initial
                .path_loss_exponent
                .unwrap_or(DEFAULT_PATH_LOSS_EXPONENT),
        })
    }

    fn parameter_count(&self) -> usize {
        D + self.targets.count()
    }

    fn residual_count(&self) -> usize {
        self.readings
            .iter()
            .map(|r| {
                self.model.distance_of(r).is_some() as usize
                    + self.model.rssi_of(r).is_some() as usize
            })
            .sum()
    }

    fn pack(&self, candidate: &Candidate<D>) -> DVector<f64> {
        let mut theta = DVector::zeros(self.parameter_count());
        theta.rows_mut(0, D).copy_from(&candidate.position.coords);

        let mut index = D;
        if self.targets.transmitted_power {
            theta[index] = candidate.transmitted_power_dbm.unwrap_or(self.tx);
            index += 1;
        }
        if self.targets.path_loss_exponent {
            theta[index] = candidate.path_loss_exponent.unwrap_or(self.exponent);
        }
        theta
    }

    /// Returns the position, transmitted power and path loss exponent in `theta`.
    fn split(&self, theta: &DVector<f64>) -> (SVector<f64, D>, f64, f64) {
        let position = SVector::from_fn(|i, _| theta[i]);
        let mut index = D;
        let tx = match self.targets.transmitted_power {
            true => {
                index += 1;
                theta[index - 1]
            }
            false => self.tx,
        };
        let exponent = match self.targets.path_loss_exponent {
            true => theta[index],
            false => self.exponent,
        };
        (position, tx, exponent)
    }

    fn unpack(&self, theta: &DVector<f64>) -> Candidate<D> {
        let (position, tx, exponent) = self.split(theta);
        let uses_rssi = self.model.uses_rssi();
        Candidate {
            position: Point::from(position),
            transmitted_power_dbm: uses_rssi.then_some(tx),
            path_loss_exponent: uses_rssi.then_some(exponent),
        }
    }

    fn linearize(&self, theta: &DVector<f64>) -> Linearization {
        let (x, tx, exponent) = self.split(theta);
        let rows = self.residual_count();
        let mut residuals = DVector::zeros(rows);
        let mut jacobian = DMatrix::zeros(rows, self.parameter_count());
        let mut weights = DVector::zeros(rows);

        let mut row = 0;
        for reading in self.readings {
            let diff = x - reading.position().coords;
            let distance = diff.norm().max(MIN_DISTANCE);
            let unit = diff / distance;
            let position_variance = |gradient: SVector<f64, D>| match (
                self.config.use_position_covariance,
                reading.position_covariance(),
            ) {
                (true, Some(covariance)) => gradient.dot(&(covariance * gradient)),
                _ => 0.,
            };

            if let Some(observed) = self.model.distance_of(reading) {
                residuals[row] = observed - distance;
                for j in 0..D {
                    jacobian[(row, j)] = -unit[j];
                }

                let std = reading
                    .distance_std()
                    .unwrap_or(self.config.fallback_distance_std);
                weights[row] = 1. / (std * std + position_variance(unit));
                row += 1;
            }

            if let Some(observed) = self.model.rssi_of(reading) {
                // Derivative of the residual with respect to the distance.
                let slope = 10. * exponent / (LN_10 * distance);
                residuals[row] = observed - received_power_dbm(tx, distance, exponent);
                for j in 0..D {
                    jacobian[(row, j)] = slope * unit[j];
                }

                let mut col = D;
                if self.targets.transmitted_power {
                    jacobian[(row, col)] = -1.;
                    col += 1;
                }
                if self.targets.path_loss_exponent {
                    jacobian[(row, col)] = 10. * distance.log10();
                }

                let std = reading.rssi_std().unwrap_or(self.config.fallback_rssi_std);
                weights[row] = 1. / (std * std + position_variance(unit * slope));
                row += 1;
            }
        }

        Linearization {
            residuals,
            jacobian,
            weights,
        }
    }
}

impl Linearization {
    fn cost(&self) -> f64 {
        self.residuals
            .iter()
            .zip(self.weights.iter())
            .map(|(r, w)| w * r * r)
            .sum()
    }

    /// Returns `J^T W J` and `J^T W r`.
    fn normal_equations(&self) -> (DMatrix<f64>, DVector<f64>) {
        let mut weighted = self.jacobian.clone();
        for (mut row, weight) in weighted.row_iter_mut().zip(self.weights.iter()) {
            row *= *weight;
        }

        (
            self.jacobian.transpose() * &weighted,
            weighted.transpose() * &self.residuals,
        )
    }
}
