use super::{
    Estimate, EstimatorListener, Lock, SharedListener, check_path_loss_exponent, check_readings,
    check_transmitted_power, notify,
};
use crate::{
    config::{JointConfig, RefinementConfig},
    error::Error,
    model::{SourceModel, Targets},
    power::DEFAULT_PATH_LOSS_EXPONENT,
    reading::Reading,
    refine::{RefineParams, refine},
    solver::{LinearSolver, SolverParams, initial_candidate},
    source::LocatedSource,
};
use nalgebra::{DMatrix, Point, SMatrix};
use std::{cell::RefCell, rc::Rc};
use tracing::debug;

/// Estimates a radio source by refining over every reading.
///
/// Faster than [`RobustEstimator`](super::RobustEstimator) and deterministic,
/// but a single outlying reading biases the result.
pub struct JointEstimator<'a, const D: usize> {
    model: SourceModel,
    targets: Targets,
    config: JointConfig,
    readings: Option<&'a [Reading<D>]>,
    initial_position: Option<Point<f64, D>>,
    initial_transmitted_power_dbm: Option<f64>,
    initial_path_loss_exponent: f64,
    listener: Option<SharedListener<Self>>,
    lock: Lock,
    estimate: Option<Estimate<D>>,
}

impl<'a, const D: usize> JointEstimator<'a, D> {
    pub fn new(model: SourceModel) -> Self {
        Self {
            model,
            targets: model.default_targets(),
            config: JointConfig::default(),
            readings: None,
            initial_position: None,
            initial_transmitted_power_dbm: None,
            initial_path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            listener: None,
            lock: Lock::default(),
            estimate: None,
        }
    }

    pub fn with_config(model: SourceModel, config: JointConfig) -> Result<Self, Error> {
        let mut estimator = Self::new(model);
        estimator.set_config(config)?;
        Ok(estimator)
    }

    pub fn model(&self) -> SourceModel {
        self.model
    }

    pub fn targets(&self) -> Targets {
        self.targets
    }

    pub fn config(&self) -> &JointConfig {
        &self.config
    }

    pub fn readings(&self) -> Option<&'a [Reading<D>]> {
        self.readings
    }

    pub fn initial_position(&self) -> Option<&Point<f64, D>> {
        self.initial_position.as_ref()
    }

    pub fn initial_transmitted_power_dbm(&self) -> Option<f64> {
        self.initial_transmitted_power_dbm
    }

    pub fn initial_path_loss_exponent(&self) -> f64 {
        self.initial_path_loss_exponent
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn min_readings(&self) -> usize {
        self.model.min_readings::<D>(self.targets)
    }

    pub fn set_readings(&mut self, readings: &'a [Reading<D>]) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_readings(self.model, readings)?;
        self.readings = Some(readings);
        Ok(())
    }

    pub fn set_targets(&mut self, targets: Targets) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.model.check_targets(targets)?;
        self.targets = targets;
        Ok(())
    }

    pub fn set_transmitted_power_estimated(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_targets(self.targets.with_transmitted_power(enabled))
    }

    pub fn set_path_loss_exponent_estimated(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_targets(self.targets.with_path_loss_exponent(enabled))
    }

    /// Starting position of the refinement. Solved from the readings when
    /// absent.
    pub fn set_initial_position(&mut self, position: Option<Point<f64, D>>) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        if let Some(value) = position
            .iter()
            .flat_map(|p| p.coords.iter())
            .find(|v| !v.is_finite())
        {
            return Err(Error::NonFinite { value: *value });
        }

        self.initial_position = position;
        Ok(())
    }

    pub fn set_initial_transmitted_power_dbm(&mut self, tx: Option<f64>) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_transmitted_power(tx)?;
        self.initial_transmitted_power_dbm = tx;
        Ok(())
    }

    pub fn set_initial_path_loss_exponent(&mut self, exponent: f64) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_path_loss_exponent(exponent)?;
        self.initial_path_loss_exponent = exponent;
        Ok(())
    }

    pub fn set_config(&mut self, config: JointConfig) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_linear_solver(&mut self, solver: LinearSolver) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.config.linear_solver = solver;
        Ok(())
    }

    pub fn set_refinement(&mut self, refinement: RefinementConfig) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        refinement.validate()?;
        self.config.refinement = refinement;
        Ok(())
    }

    pub fn set_listener<L>(&mut self, listener: Rc<RefCell<L>>) -> Result<(), Error>
    where
        L: EstimatorListener<Self> + 'static,
    {
        self.lock.ensure_unlocked()?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn clear_listener(&mut self) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.listener = None;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.readings.is_some_and(|readings| {
            self.model.is_valid(readings, self.targets)
                && (!self.model.uses_rssi()
                    || self.targets.transmitted_power
                    || self.initial_transmitted_power_dbm.is_some())
        })
    }

    /// Refines the source over every reading. The result always carries the
    /// covariance of the estimated parameters.
    pub fn estimate(&mut self) -> Result<&Estimate<D>, Error> {
        self.lock.ensure_unlocked()?;
        self.estimate = None;

        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let Some(readings) = self.readings else {
            return Err(Error::NotReady);
        };

        let _guard = self.lock.acquire();
        self.emit(|listener, estimator| listener.on_estimate_start(estimator));
        let result = self.run(readings);
        self.emit(|listener, estimator| listener.on_estimate_end(estimator));
        result?;

        self.estimate.as_ref().ok_or(Error::NotReady)
    }

    fn emit<F>(&mut self, event: F)
    where
        F: FnOnce(&mut dyn EstimatorListener<Self>, &mut Self),
    {
        notify(self.listener.clone(), self, event);
    }

    fn run(&mut self, readings: &'a [Reading<D>]) -> Result<(), Error> {
        let readings: Vec<&Reading<D>> = readings.iter().collect();
        let params = SolverParams {
            model: self.model,
            targets: self.targets,
            linear_solver: self.config.linear_solver,
            transmitted_power_dbm: self.initial_transmitted_power_dbm,
            path_loss_exponent: self.initial_path_loss_exponent,
            refinement: self.config.refinement.clone(),
        };
        let initial = initial_candidate(&readings, &params, self.initial_position).map_err(|err| {
            debug!(%err, "no initial guess for joint estimation");
            Error::RefinementFailed("initial guess could not be solved")
        })?;

        let refinement = refine(
            &readings,
            &initial,
            &RefineParams {
                model: self.model,
                targets: self.targets,
                config: self.config.refinement.clone(),
                keep_covariance: true,
            },
        )?;
        debug!(
            readings = readings.len(),
            iterations = refinement.iterations,
            cost = refinement.cost,
            "joint estimation finished"
        );

        self.estimate = Some(Estimate::new(
            refinement.candidate,
            refinement.covariance,
            self.targets,
        ));
        Ok(())
    }

    pub fn result(&self) -> Option<&Estimate<D>> {
        self.estimate.as_ref()
    }

    pub fn estimated_position(&self) -> Option<&Point<f64, D>> {
        self.estimate.as_ref().map(Estimate::position)
    }

    /// The estimate attached to the identity of the first reading.
    pub fn estimated_radio_source(&self) -> Option<LocatedSource<D>> {
        let source = self.readings?.first()?.source();
        Some(self.estimate.as_ref()?.located_source(source))
    }

    pub fn estimated_transmitted_power_dbm(&self) -> Option<f64> {
        self.estimate.as_ref()?.transmitted_power_dbm()
    }

    pub fn estimated_transmitted_power_variance(&self) -> Option<f64> {
        self.estimate.as_ref()?.transmitted_power_variance()
    }

    pub fn estimated_path_loss_exponent(&self) -> Option<f64> {
        self.estimate.as_ref()?.path_loss_exponent()
    }

    pub fn estimated_path_loss_exponent_variance(&self) -> Option<f64> {
        self.estimate.as_ref()?.path_loss_exponent_variance()
    }

    pub fn estimated_covariance(&self) -> Option<&DMatrix<f64>> {
        self.estimate.as_ref()?.covariance()
    }

    pub fn estimated_position_covariance(&self) -> Option<SMatrix<f64, D, D>> {
        self.estimate.as_ref()?.position_covariance()
    }
}
