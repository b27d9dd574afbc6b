//! Estimators of a radio source from a collection of readings.
//!
//! Estimators are configured through guarded setters and run with a single
//! blocking `estimate` call. While an estimation runs the estimator is
//! locked: every mutator and nested `estimate` call returns
//! [`Error::Locked`], including the ones made from listener callbacks.

mod joint;
mod robust;

pub use joint::JointEstimator;
pub use robust::RobustEstimator;

use crate::{
    error::Error,
    model::{SourceModel, Targets},
    reading::Reading,
    solver::Candidate,
    source::{LocatedSource, RadioSource},
};
use nalgebra::{DMatrix, Point, SMatrix};
use std::{cell::Cell, cell::RefCell, rc::Rc};

/// Receives the progress of an estimator of type `E`.
///
/// Every method has an empty default so that listeners only implement the
/// events they care about. Callbacks run on the thread that called
/// `estimate` and receive the estimator itself, which is locked.
pub trait EstimatorListener<E: ?Sized> {
    fn on_estimate_start(&mut self, _estimator: &mut E) {}

    fn on_estimate_end(&mut self, _estimator: &mut E) {}

    /// Called after every trial with its zero based index.
    fn on_estimate_next_iteration(&mut self, _estimator: &mut E, _iteration: usize) {}

    /// Called when the progress in `[0, 1]` advanced by more than the
    /// configured delta since the last call.
    fn on_estimate_progress_change(&mut self, _estimator: &mut E, _progress: f32) {}
}

pub(crate) type SharedListener<E> = Rc<RefCell<dyn EstimatorListener<E>>>;

/// Calls `event` on the listener of an estimator, if any.
///
/// A listener that is already borrowed, because it is shared with an
/// estimator that is notifying it, does not receive the event.
pub(crate) fn notify<E, F>(listener: Option<SharedListener<E>>, estimator: &mut E, event: F)
where
    F: FnOnce(&mut dyn EstimatorListener<E>, &mut E),
{
    if let Some(listener) = listener {
        if let Ok(mut listener) = listener.try_borrow_mut() {
            event(&mut *listener, estimator);
        }
    }
}

pub(crate) fn check_readings<const D: usize>(
    model: SourceModel,
    readings: &[Reading<D>],
) -> Result<(), Error> {
    if readings.is_empty() {
        return Err(Error::EmptyReadings);
    }
    match readings.iter().all(|r| model.accepts(r)) {
        true => Ok(()),
        false => Err(Error::MissingChannel),
    }
}

pub(crate) fn check_transmitted_power(tx: Option<f64>) -> Result<(), Error> {
    match tx {
        Some(value) if !value.is_finite() => Err(Error::NonFinite { value }),
        _ => Ok(()),
    }
}

pub(crate) fn check_path_loss_exponent(exponent: f64) -> Result<(), Error> {
    match exponent.is_finite() && exponent > 0. {
        true => Ok(()),
        false => Err(Error::InvalidPathLossExponent { exponent }),
    }
}

/// Flag raised for the duration of an estimation.
#[derive(Clone, Debug, Default)]
pub(crate) struct Lock(Rc<Cell<bool>>);

impl Lock {
    pub fn is_locked(&self) -> bool {
        self.0.get()
    }

    pub fn ensure_unlocked(&self) -> Result<(), Error> {
        match self.is_locked() {
            true => Err(Error::Locked),
            false => Ok(()),
        }
    }

    /// Raises the flag until the returned guard is dropped.
    pub fn acquire(&self) -> LockGuard {
        self.0.set(true);
        LockGuard(self.0.clone())
    }
}

pub(crate) struct LockGuard(Rc<Cell<bool>>);

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Result of a successful estimation.
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate<const D: usize> {
    position: Point<f64, D>,
    transmitted_power_dbm: Option<f64>,
    path_loss_exponent: Option<f64>,

    /// Rows and columns follow the position coordinates, then the
    /// transmitted power and the path loss exponent if they were estimated.
    covariance: Option<DMatrix<f64>>,
    targets: Targets,
}

impl<const D: usize> Estimate<D> {
    pub(crate) fn new(
        candidate: Candidate<D>,
        covariance: Option<DMatrix<f64>>,
        targets: Targets,
    ) -> Self {
        Self {
            position: candidate.position,
            transmitted_power_dbm: candidate.transmitted_power_dbm,
            path_loss_exponent: candidate.path_loss_exponent,
            covariance,
            targets,
        }
    }

    pub fn position(&self) -> &Point<f64, D> {
        &self.position
    }

    pub fn transmitted_power_dbm(&self) -> Option<f64> {
        self.transmitted_power_dbm
    }

    pub fn path_loss_exponent(&self) -> Option<f64> {
        self.path_loss_exponent
    }

    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    pub fn transmitted_power_variance(&self) -> Option<f64> {
        let covariance = self.covariance.as_ref()?;
        self.targets
            .transmitted_power
            .then(|| covariance[(D, D)])
    }

    pub fn path_loss_exponent_variance(&self) -> Option<f64> {
        let covariance = self.covariance.as_ref()?;
        let index = D + self.targets.transmitted_power as usize;
        self.targets
            .path_loss_exponent
            .then(|| covariance[(index, index)])
    }

    /// Upper left block of the covariance.
    pub fn position_covariance(&self) -> Option<SMatrix<f64, D, D>> {
        self.covariance
            .as_ref()
            .map(|covariance| covariance.fixed_view::<D, D>(0, 0).into_owned())
    }

    /// Attaches the estimate to the identity of `source`.
    pub fn located_source(&self, source: &RadioSource) -> LocatedSource<D> {
        LocatedSource::new(
            source.clone(),
            self.position,
            self.transmitted_power_dbm,
            self.path_loss_exponent,
            self.position_covariance(),
        )
    }
}
