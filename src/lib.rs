//! Radio Source Localization
//!
//! Estimates the position of a WiFi access point or a Bluetooth beacon from
//! readings taken at known positions. A reading carries a measured distance,
//! a received power in dBm, or both. Power readings are related to the
//! distance through the log-distance path loss model, whose transmitted power
//! and exponent can be estimated along with the position.
//!
//! Two estimators are provided:
//!
//! - [`RobustEstimator`](estimator::RobustEstimator) draws minimal subsets of
//!   readings with RANSAC, LMedS, MSAC, PROSAC or PROMedS and refines the
//!   best candidate over its inliers.
//! - [`JointEstimator`](estimator::JointEstimator) refines over all readings.
//!
//! ```
//! use nalgebra::point;
//! use radiolocate::prelude::*;
//! use uom::si::{f64::Frequency, frequency::gigahertz};
//!
//! let ap = RadioSource::wifi_access_point("00:11:22:33:44:55", Frequency::new::<gigahertz>(2.4));
//! let truth = point![10.0, 10.0];
//! let readings: Vec<Reading<2>> = [
//!     point![0.0, 0.0],
//!     point![20.0, 0.0],
//!     point![0.0, 20.0],
//!     point![20.0, 20.0],
//! ]
//! .into_iter()
//! .map(|p| Reading::ranging(ap.clone(), p, nalgebra::distance(&p, &truth)))
//! .collect::<Result<_, _>>()?;
//!
//! let mut estimator = RobustEstimator::new(SourceModel::Ranging, RobustMethod::Ransac);
//! estimator.set_readings(&readings)?;
//! let estimate = estimator.estimate()?;
//! assert!(nalgebra::distance(estimate.position(), &truth) < 1e-6);
//! # Ok::<(), radiolocate::error::Error>(())
//! ```

#[allow(missing_docs)]
pub mod error;

pub mod config;
pub mod consensus;
pub mod estimator;
pub mod model;
pub mod power;
pub mod reading;
pub mod refine;
pub mod solver;
pub mod source;

pub mod prelude {
    pub use crate::{
        config::{JointConfig, RefinementConfig, RobustConfig},
        consensus::{InliersData, RobustMethod},
        error::Error,
        estimator::{Estimate, EstimatorListener, JointEstimator, RobustEstimator},
        model::{SourceModel, Targets},
        reading::Reading,
        solver::LinearSolver,
        source::{LocatedSource, RadioSource, SourceKind},
    };
}
