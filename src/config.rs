//! Estimator configuration.
//!
//! Every estimator keeps one of these structs and only mutates it through
//! its guarded setters. Each struct can also be built up front, checked with
//! `validate`, and handed to the estimator in one go.

use crate::{error::Error, solver::LinearSolver};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Settings of the weighted Levenberg-Marquardt refinement.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RefinementConfig {
    pub max_iterations: usize,

    /// Propagate observer position covariances into the residual weights.
    pub use_position_covariance: bool,

    /// Standard deviation in metres used for distances without one.
    pub fallback_distance_std: f64,

    /// Standard deviation in dB used for received powers without one.
    pub fallback_rssi_std: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            use_position_covariance: true,
            fallback_distance_std: 1e-3,
            fallback_rssi_std: 1e-3,
        }
    }
}

impl RefinementConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_iterations == 0 {
            return Err(Error::MaxIterationsOutOfRange {
                iterations: self.max_iterations,
            });
        }
        for std in [self.fallback_distance_std, self.fallback_rssi_std] {
            if !(std.is_finite() && std > 0.) {
                return Err(Error::InvalidStandardDeviation { std });
            }
        }

        Ok(())
    }
}

/// Settings of a [`RobustEstimator`](crate::estimator::RobustEstimator).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RobustConfig {
    /// Residual below which a reading is an inlier (RANSAC, MSAC, PROSAC).
    pub threshold: f64,

    /// Median residual at which LMedS and PROMedS stop early.
    pub stop_threshold: f64,

    /// Probability of drawing at least one outlier free subset.
    pub confidence: f64,
    pub max_iterations: usize,

    /// Minimum progress advance between two progress notifications.
    pub progress_delta: f32,

    /// Refine the best candidate over its inliers.
    pub result_refined: bool,

    /// Keep the covariance of the refined result.
    pub covariance_kept: bool,
    pub linear_solver: LinearSolver,

    /// Readings per trial. Defaults to the minimum for the estimated targets.
    pub preliminary_subset_size: Option<usize>,

    /// Seed of the subset sampler. A fresh seed is drawn on every estimation
    /// when absent.
    pub seed: Option<u64>,
    pub refinement: RefinementConfig,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            stop_threshold: 1e-3,
            confidence: 0.99,
            max_iterations: 5000,
            progress_delta: 0.05,
            result_refined: true,
            covariance_kept: true,
            linear_solver: LinearSolver::default(),
            preliminary_subset_size: None,
            seed: None,
            refinement: RefinementConfig::default(),
        }
    }
}

impl RobustConfig {
    /// Checks every field that does not depend on the readings.
    pub fn validate(&self) -> Result<(), Error> {
        check_threshold(self.threshold)?;
        check_threshold(self.stop_threshold)?;
        check_confidence(self.confidence)?;
        check_max_iterations(self.max_iterations)?;
        check_progress_delta(self.progress_delta)?;
        self.refinement.validate()
    }
}

/// Settings of a [`JointEstimator`](crate::estimator::JointEstimator).
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct JointConfig {
    pub linear_solver: LinearSolver,
    pub refinement: RefinementConfig,
}

impl JointConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.refinement.validate()
    }
}

pub(crate) fn check_threshold(threshold: f64) -> Result<(), Error> {
    match threshold.is_finite() && threshold > 0. {
        true => Ok(()),
        false => Err(Error::ThresholdOutOfRange { threshold }),
    }
}

pub(crate) fn check_confidence(confidence: f64) -> Result<(), Error> {
    match confidence > 0. && confidence < 1. {
        true => Ok(()),
        false => Err(Error::ConfidenceOutOfRange { confidence }),
    }
}

pub(crate) fn check_max_iterations(iterations: usize) -> Result<(), Error> {
    match iterations >= 1 {
        true => Ok(()),
        false => Err(Error::MaxIterationsOutOfRange { iterations }),
    }
}

pub(crate) fn check_progress_delta(delta: f32) -> Result<(), Error> {
    match (0.0..=1.0).contains(&delta) {
        true => Ok(()),
        false => Err(Error::ProgressDeltaOutOfRange { delta }),
    }
}
