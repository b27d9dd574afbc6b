use super::{
    Estimate, EstimatorListener, Lock, SharedListener, check_path_loss_exponent, check_readings,
    check_transmitted_power, notify,
};
use crate::{
    config::{
        RefinementConfig, RobustConfig, check_confidence, check_max_iterations,
        check_progress_delta, check_threshold,
    },
    consensus::{
        InliersData, ProgressiveSampler, RobustMethod, Sampler, UniformSampler, required_iterations,
        residuals,
    },
    error::Error,
    model::{SourceModel, Targets},
    power::DEFAULT_PATH_LOSS_EXPONENT,
    reading::Reading,
    refine::{RefineParams, refine},
    solver::{Candidate, LinearSolver, SolverParams, solve},
    source::LocatedSource,
};
use nalgebra::{DMatrix, Point, SMatrix};
use rand::{SeedableRng, rngs::StdRng};
use std::{cell::RefCell, rc::Rc};
use tracing::{debug, trace, warn};

/// Estimates a radio source while tolerating outlying readings.
///
/// Minimal subsets of readings are drawn by the configured
/// [`RobustMethod`], each one is solved in closed form and scored against
/// every reading. The best candidate is then refined over its inliers.
pub struct RobustEstimator<'a, const D: usize> {
    model: SourceModel,
    method: RobustMethod,
    targets: Targets,
    config: RobustConfig,
    readings: Option<&'a [Reading<D>]>,
    quality_scores: Option<Vec<f64>>,
    initial_transmitted_power_dbm: Option<f64>,
    initial_path_loss_exponent: f64,
    listener: Option<SharedListener<Self>>,
    lock: Lock,
    estimate: Option<Estimate<D>>,
    inliers: Option<InliersData>,
}

struct Best<const D: usize> {
    candidate: Candidate<D>,
    score: f64,
    inliers: InliersData,
}

impl<'a, const D: usize> RobustEstimator<'a, D> {
    pub fn new(model: SourceModel, method: RobustMethod) -> Self {
        Self {
            model,
            method,
            targets: model.default_targets(),
            config: RobustConfig::default(),
            readings: None,
            quality_scores: None,
            initial_transmitted_power_dbm: None,
            initial_path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            listener: None,
            lock: Lock::default(),
            estimate: None,
            inliers: None,
        }
    }

    pub fn with_config(
        model: SourceModel,
        method: RobustMethod,
        config: RobustConfig,
    ) -> Result<Self, Error> {
        let mut estimator = Self::new(model, method);
        estimator.set_config(config)?;
        Ok(estimator)
    }

    pub fn model(&self) -> SourceModel {
        self.model
    }

    pub fn method(&self) -> RobustMethod {
        self.method
    }

    pub fn targets(&self) -> Targets {
        self.targets
    }

    pub fn config(&self) -> &RobustConfig {
        &self.config
    }

    pub fn readings(&self) -> Option<&'a [Reading<D>]> {
        self.readings
    }

    pub fn quality_scores(&self) -> Option<&[f64]> {
        self.quality_scores.as_deref()
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

    /// Smallest number of readings that determines the estimated parameters.
    pub fn min_readings(&self) -> usize {
        self.model.min_readings::<D>(self.targets)
    }

    /// Number of readings drawn per trial.
    pub fn subset_size(&self) -> usize {
        self.config
            .preliminary_subset_size
            .unwrap_or_else(|| self.min_readings())
    }

    pub fn set_readings(&mut self, readings: &'a [Reading<D>]) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_readings(self.model, readings)?;
        self.readings = Some(readings);
        Ok(())
    }

    /// Sets one quality score per reading, higher meaning more trustworthy.
    ///
    /// The length is only checked against the readings by
    /// [`estimate`](Self::estimate).
    pub fn set_quality_scores(&mut self, scores: Vec<f64>) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        if let Some((index, score)) = scores
            .iter()
            .enumerate()
            .find(|(_, s)| !(s.is_finite() && **s >= 0.))
        {
            return Err(Error::InvalidQualityScore {
                index,
                score: *score,
            });
        }

        self.quality_scores = Some(scores);
        Ok(())
    }

    pub fn set_targets(&mut self, targets: Targets) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.model.check_targets(targets)?;
        check_subset_size::<D>(self.config.preliminary_subset_size, self.model, targets)?;
        self.targets = targets;
        Ok(())
    }

    pub fn set_transmitted_power_estimated(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_targets(self.targets.with_transmitted_power(enabled))
    }

    pub fn set_path_loss_exponent_estimated(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_targets(self.targets.with_path_loss_exponent(enabled))
    }

    /// Transmitted power used when it is not estimated, and as the starting
    /// point of its estimation otherwise.
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

    pub fn set_config(&mut self, config: RobustConfig) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        config.validate()?;
        check_subset_size::<D>(config.preliminary_subset_size, self.model, self.targets)?;
        self.config = config;
        Ok(())
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_threshold(threshold)?;
        self.config.threshold = threshold;
        Ok(())
    }

    pub fn set_stop_threshold(&mut self, threshold: f64) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_threshold(threshold)?;
        self.config.stop_threshold = threshold;
        Ok(())
    }

    pub fn set_confidence(&mut self, confidence: f64) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_confidence(confidence)?;
        self.config.confidence = confidence;
        Ok(())
    }

    pub fn set_max_iterations(&mut self, iterations: usize) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_max_iterations(iterations)?;
        self.config.max_iterations = iterations;
        Ok(())
    }

    pub fn set_progress_delta(&mut self, delta: f32) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_progress_delta(delta)?;
        self.config.progress_delta = delta;
        Ok(())
    }

    pub fn set_result_refined(&mut self, refined: bool) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.config.result_refined = refined;
        Ok(())
    }

    pub fn set_covariance_kept(&mut self, kept: bool) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.config.covariance_kept = kept;
        Ok(())
    }

    pub fn set_linear_solver(&mut self, solver: LinearSolver) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.config.linear_solver = solver;
        Ok(())
    }

    pub fn set_preliminary_subset_size(&mut self, size: usize) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        check_subset_size::<D>(Some(size), self.model, self.targets)?;
        self.config.preliminary_subset_size = Some(size);
        Ok(())
    }

    pub fn set_seed(&mut self, seed: Option<u64>) -> Result<(), Error> {
        self.lock.ensure_unlocked()?;
        self.config.seed = seed;
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

    /// Returns `true` if [`estimate`](Self::estimate) can run.
    pub fn is_ready(&self) -> bool {
        let Some(readings) = self.readings else {
            return false;
        };

        self.model.is_valid(readings, self.targets)
            && readings.len() >= self.subset_size()
            && (!self.model.uses_rssi()
                || self.targets.transmitted_power
                || self.initial_transmitted_power_dbm.is_some())
            && self.check_quality_scores().is_ok()
    }

    fn check_quality_scores(&self) -> Result<(), Error> {
        if !self.method.requires_quality_scores() {
            return Ok(());
        }

        let expected = self.readings.map_or(0, <[_]>::len);
        let actual = self.quality_scores.as_ref().map_or(0, Vec::len);
        match expected == actual {
            true => Ok(()),
            false => Err(Error::QualityScoresLengthMismatch { expected, actual }),
        }
    }

    /// Runs the estimation.
    ///
    /// The previous result is discarded first. When the refinement of the
    /// best candidate fails, the unrefined candidate is kept as the result
    /// and the refinement error is returned.
    pub fn estimate(&mut self) -> Result<&Estimate<D>, Error> {
        self.lock.ensure_unlocked()?;
        self.estimate = None;
        self.inliers = None;

        self.check_quality_scores()?;
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
        let config = self.config.clone();
        let quality = self.quality_scores.clone();
        let size = self.subset_size();
        let mut rng = config
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

        let best = match (self.method.requires_quality_scores(), quality.as_deref()) {
            (true, Some(quality)) => {
                let sampler = ProgressiveSampler::new(quality, size, config.max_iterations);
                self.consensus(readings, &config, Some(quality), sampler, &mut rng)?
            }
            _ => {
                let sampler = UniformSampler::new(readings.len(), size);
                self.consensus(readings, &config, None, sampler, &mut rng)?
            }
        };

        let inlier_readings: Vec<&Reading<D>> =
            best.inliers.inlier_indices().map(|i| &readings[i]).collect();
        let refined = config.result_refined
            && self
                .model
                .is_valid(inlier_readings.iter().copied(), self.targets);
        self.inliers = Some(best.inliers);

        if !refined {
            self.estimate = Some(Estimate::new(best.candidate, None, self.targets));
            return Ok(());
        }

        let params = RefineParams {
            model: self.model,
            targets: self.targets,
            config: config.refinement,
            keep_covariance: config.covariance_kept,
        };
        match refine(&inlier_readings, &best.candidate, &params) {
            Ok(refinement) => {
                self.estimate = Some(Estimate::new(
                    refinement.candidate,
                    refinement.covariance,
                    self.targets,
                ));
                Ok(())
            }
            Err(err) => {
                warn!(%err, "keeping unrefined candidate");
                self.estimate = Some(Estimate::new(best.candidate, None, self.targets));
                Err(err)
            }
        }
    }

    fn consensus<S: Sampler>(
        &mut self,
        readings: &'a [Reading<D>],
        config: &RobustConfig,
        quality: Option<&[f64]>,
        mut sampler: S,
        rng: &mut StdRng,
    ) -> Result<Best<D>, Error> {
        let size = sampler.subset_size();
        let params = SolverParams {
            model: self.model,
            targets: self.targets,
            linear_solver: config.linear_solver,
            transmitted_power_dbm: self.initial_transmitted_power_dbm,
            path_loss_exponent: self.initial_path_loss_exponent,
            refinement: config.refinement.clone(),
        };

        let mut best: Option<Best<D>> = None;
        let mut required = config.max_iterations;
        let mut progress = 0.;
        let mut iteration = 0;
        while iteration < required {
            let subset: Vec<&Reading<D>> = sampler
                .sample(rng)
                .into_iter()
                .map(|i| &readings[i])
                .collect();

            let mut converged = false;
            if let Some((candidate, residuals, score)) =
                self.trial(&subset, readings, &params, config, quality, iteration)
                && best.as_ref().is_none_or(|best| score > best.score)
            {
                let threshold = self.method.inlier_threshold(
                    score,
                    readings.len(),
                    size,
                    config.threshold,
                    config.stop_threshold,
                );
                let inliers = InliersData::new(residuals, threshold);
                required = required_iterations(
                    inliers.inlier_ratio(),
                    size,
                    config.confidence,
                    config.max_iterations,
                );
                trace!(
                    iteration,
                    score,
                    inliers = inliers.num_inliers(),
                    required,
                    "new best candidate"
                );

                converged = self.method.uses_median() && (-score).sqrt() <= config.stop_threshold;
                best = Some(Best {
                    candidate,
                    score,
                    inliers,
                });
            }

            self.emit(|listener, estimator| {
                listener.on_estimate_next_iteration(estimator, iteration)
            });
            iteration += 1;

            let current = (iteration as f32 / required as f32).min(1.);
            if current - progress > config.progress_delta {
                progress = current;
                self.emit(|listener, estimator| {
                    listener.on_estimate_progress_change(estimator, progress)
                });
            }

            if converged {
                break;
            }
        }

        let best = best.ok_or(Error::RobustEstimationFailed {
            iterations: iteration,
        })?;
        debug!(
            method = ?self.method,
            iterations = iteration,
            inliers = best.inliers.num_inliers(),
            "consensus finished"
        );
        Ok(best)
    }

    /// Solves `subset` and scores the candidate against every reading.
    ///
    /// Returns `None` for subsets that cannot produce a candidate.
    fn trial(
        &self,
        subset: &[&Reading<D>],
        readings: &[Reading<D>],
        params: &SolverParams,
        config: &RobustConfig,
        quality: Option<&[f64]>,
        iteration: usize,
    ) -> Option<(Candidate<D>, Vec<f64>, f64)> {
        if !self.model.is_valid(subset.iter().copied(), self.targets) {
            trace!(iteration, "skipping invalid subset");
            return None;
        }

        let candidate = solve(subset, params)
            .inspect_err(|err| trace!(iteration, %err, "skipping subset"))
            .ok()?;
        let residuals = residuals(self.model, &candidate, readings);
        let score = self.method.score(&residuals, config.threshold, quality);
        (!score.is_nan()).then_some((candidate, residuals, score))
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

    pub fn inliers_data(&self) -> Option<&InliersData> {
        self.inliers.as_ref()
    }
}

fn check_subset_size<const D: usize>(
    size: Option<usize>,
    model: SourceModel,
    targets: Targets,
) -> Result<(), Error> {
    let min = model.min_readings::<D>(targets);
    match size {
        Some(size) if size < min => Err(Error::SubsetSizeTooSmall { size, min }),
        _ => Ok(()),
    }
}
