//! Sample consensus scoring and sampling.
//!
//! Every strategy scores a candidate so that a higher score is better. Count
//! based strategies separate inliers with the configured threshold, while
//! median based strategies estimate it from the residual distribution.

mod sampler;

pub use sampler::{ProgressiveSampler, Sampler, UniformSampler};

use crate::{
    model::SourceModel,
    power::{DEFAULT_PATH_LOSS_EXPONENT, received_power_dbm},
    reading::Reading,
    solver::{Candidate, MIN_DISTANCE},
};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Consistency factor of the median absolute deviation of a normal
/// distribution.
const MEDIAN_CONSISTENCY: f64 = 1.4826;

/// Multiple of the robust standard deviation accepted as inlier.
const MEDIAN_INLIER_FACTOR: f64 = 2.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RobustMethod {
    /// Random sample consensus. Maximises the number of inliers.
    Ransac,

    /// Least median of squares.
    Lmeds,

    /// M-estimator sample consensus. Minimises truncated squared residuals.
    Msac,

    /// Progressive sample consensus. Samples the best rated readings first
    /// and maximises the quality of the inliers.
    Prosac,

    /// Progressive least median of squares, with a quality weighted median.
    Promeds,
}

impl RobustMethod {
    pub fn requires_quality_scores(&self) -> bool {
        matches!(self, Self::Prosac | Self::Promeds)
    }

    /// Returns `true` if the inlier threshold is estimated from the median.
    pub fn uses_median(&self) -> bool {
        matches!(self, Self::Lmeds | Self::Promeds)
    }

    /// Scores `residuals`. Higher is better.
    ///
    /// `quality` is only read by the quality driven strategies and must then
    /// have one entry per residual.
    pub fn score(&self, residuals: &[f64], threshold: f64, quality: Option<&[f64]>) -> f64 {
        match (self, quality) {
            (Self::Ransac, _) | (Self::Prosac, None) => {
                residuals.iter().filter(|r| **r <= threshold).count() as f64
            }
            (Self::Msac, _) => -residuals
                .iter()
                .map(|r| r.min(threshold).powi(2))
                .sum::<f64>(),
            (Self::Lmeds, _) | (Self::Promeds, None) => -median(squared(residuals)),
            (Self::Prosac, Some(quality)) => residuals
                .iter()
                .zip(quality)
                .filter(|(r, _)| **r <= threshold)
                .map(|(_, q)| q)
                .sum(),
            (Self::Promeds, Some(quality)) => -weighted_median(squared(residuals), quality),
        }
    }

    /// Residual below which a reading is an inlier of a candidate that
    /// received `score`.
    ///
    /// Median based strategies derive it from the robust standard deviation
    /// of the residuals of a `subset_size` sample, and never go below
    /// `stop_threshold`.
    pub fn inlier_threshold(
        &self,
        score: f64,
        len: usize,
        subset_size: usize,
        threshold: f64,
        stop_threshold: f64,
    ) -> f64 {
        if !self.uses_median() {
            return threshold;
        }

        let correction = match len > subset_size {
            true => 1. + 5. / (len - subset_size) as f64,
            false => 1.,
        };
        let sigma = MEDIAN_CONSISTENCY * correction * (-score).max(0.).sqrt();
        (MEDIAN_INLIER_FACTOR * sigma).max(stop_threshold)
    }
}

/// Inlier classification of the readings against the best candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct InliersData {
    inliers: Vec<bool>,
    residuals: Vec<f64>,
    num_inliers: usize,
    threshold: f64,
}

impl InliersData {
    pub fn new(residuals: Vec<f64>, threshold: f64) -> Self {
        let inliers: Vec<bool> = residuals.iter().map(|r| *r <= threshold).collect();
        let num_inliers = inliers.iter().filter(|i| **i).count();
        Self {
            inliers,
            residuals,
            num_inliers,
            threshold,
        }
    }

    /// One flag per reading, in reading order.
    pub fn inliers(&self) -> &[bool] {
        &self.inliers
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn num_inliers(&self) -> usize {
        self.num_inliers
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn inlier_ratio(&self) -> f64 {
        match self.inliers.is_empty() {
            true => 0.,
            false => self.num_inliers as f64 / self.inliers.len() as f64,
        }
    }

    pub fn inlier_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.inliers
            .iter()
            .enumerate()
            .filter_map(|(i, inlier)| inlier.then_some(i))
    }
}

/// Absolute residual of `reading` against `candidate`.
///
/// The distance is compared when the model uses it and the reading carries
/// one. Otherwise the received power is compared in dB. A reading that
/// cannot be compared has an infinite residual.
pub fn residual<const D: usize>(
    model: SourceModel,
    candidate: &Candidate<D>,
    reading: &Reading<D>,
) -> f64 {
    let distance = nalgebra::distance(&candidate.position, reading.position()).max(MIN_DISTANCE);
    if let Some(observed) = model.distance_of(reading) {
        return (observed - distance).abs();
    }

    match (model.rssi_of(reading), candidate.transmitted_power_dbm) {
        (Some(observed), Some(tx)) => {
            let exponent = candidate
                .path_loss_exponent
                .unwrap_or(DEFAULT_PATH_LOSS_EXPONENT);
            (observed - received_power_dbm(tx, distance, exponent)).abs()
        }
        _ => f64::INFINITY,
    }
}

/// Residuals of every reading against `candidate`, in reading order.
pub fn residuals<const D: usize>(
    model: SourceModel,
    candidate: &Candidate<D>,
    readings: &[Reading<D>],
) -> Vec<f64> {
    readings
        .par_iter()
        .map(|reading| residual(model, candidate, reading))
        .collect()
}

/// Number of trials needed to draw an outlier free subset of `subset_size`
/// readings with probability `confidence`, given the `inlier_ratio`.
pub fn required_iterations(
    inlier_ratio: f64,
    subset_size: usize,
    confidence: f64,
    max_iterations: usize,
) -> usize {
    let outlier_free = inlier_ratio.clamp(0., 1.).powi(subset_size as i32);
    if outlier_free >= 1. {
        return 1;
    }

    let iterations = ((1. - confidence).ln() / (1. - outlier_free).ln()).ceil();
    match iterations.is_finite() && iterations >= 1. {
        true => (iterations as usize).min(max_iterations),
        false => max_iterations,
    }
}

fn squared(residuals: &[f64]) -> Vec<f64> {
    residuals.iter().map(|r| r * r).collect()
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }

    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    match values.len() % 2 {
        0 => values[mid - 1] / 2. + values[mid] / 2.,
        _ => values[mid],
    }
}

/// Smallest value at which the cumulative weight reaches half of the total.
///
/// Falls back to the plain median when no weight is positive.
fn weighted_median(values: Vec<f64>, weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if !(total > 0.) {
        return median(values);
    }

    let mut pairs: Vec<(f64, f64)> = values.into_iter().zip(weights.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cumulative = 0.;
    for (value, weight) in &pairs {
        cumulative += weight;
        if cumulative >= total / 2. {
            return *value;
        }
    }
    pairs.last().map_or(f64::INFINITY, |(value, _)| *value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RadioSource;
    use approx::assert_relative_eq;
    use nalgebra::point;
    use quickcheck::quickcheck;
    use rstest::rstest;
    use uom::si::{f64::Frequency, frequency::gigahertz};

    fn source() -> RadioSource {
        RadioSource::wifi_access_point("00:11:22:33:44:55", Frequency::new::<gigahertz>(2.4))
    }

    const RESIDUALS: [f64; 5] = [0.01, 0.02, 0.05, 3.0, 10.0];

    #[rstest]
    #[case(RobustMethod::Ransac, 3.)]
    #[case(RobustMethod::Msac, -(0.0001 + 0.0004 + 0.0025 + 0.01 + 0.01))]
    #[case(RobustMethod::Lmeds, -0.0025)]
    fn scores(#[case] method: RobustMethod, #[case] expected: f64) {
        assert_relative_eq!(method.score(&RESIDUALS, 0.1, None), expected, epsilon = 1e-12);
    }

    #[test]
    fn prosac_sums_inlier_quality() {
        let quality = [1.0, 0.5, 0.25, 100.0, 100.0];
        assert_relative_eq!(
            RobustMethod::Prosac.score(&RESIDUALS, 0.1, Some(&quality)),
            1.75
        );
    }

    #[test]
    fn promeds_weights_the_median() {
        // Most of the weight sits on the outliers.
        let quality = [0.1, 0.1, 0.1, 5.0, 5.0];
        assert_relative_eq!(
            RobustMethod::Promeds.score(&RESIDUALS, 0.1, Some(&quality)),
            -9.0
        );
    }

    #[test]
    fn median_threshold_is_bounded_by_stop_threshold() {
        let threshold = RobustMethod::Lmeds.inlier_threshold(0., 10, 3, 0.1, 1e-3);
        assert_eq!(threshold, 1e-3);

        let threshold = RobustMethod::Lmeds.inlier_threshold(-0.04, 8, 3, 0.1, 1e-3);
        assert_relative_eq!(threshold, 2.5 * 1.4826 * 2. * 0.2, epsilon = 1e-12);

        assert_eq!(RobustMethod::Msac.inlier_threshold(-0.04, 8, 3, 0.1, 1e-3), 0.1);
    }

    #[rstest]
    #[case(1.0, 3, 1)]
    #[case(0.5, 3, 35)]
    #[case(0.0, 3, 5000)]
    fn iterations(#[case] ratio: f64, #[case] size: usize, #[case] expected: usize) {
        assert_eq!(required_iterations(ratio, size, 0.99, 5000), expected);
    }

    #[test]
    fn inliers_data() {
        let data = InliersData::new(RESIDUALS.to_vec(), 0.1);
        assert_eq!(data.inliers(), &[true, true, true, false, false]);
        assert_eq!(data.num_inliers(), 3);
        assert_relative_eq!(data.inlier_ratio(), 0.6);
        assert_eq!(data.inlier_indices().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn mixed_residuals_prefer_distance() {
        let candidate = Candidate {
            position: point![0.0, 0.0],
            transmitted_power_dbm: Some(-40.0),
            path_loss_exponent: Some(2.0),
        };
        let both = Reading::ranging_and_rssi(source(), point![3.0, 4.0], 5.5, -40.0).unwrap();
        let power = Reading::rssi(source(), point![10.0, 0.0], -62.0).unwrap();

        assert_relative_eq!(residual(SourceModel::RangingAndRssi, &candidate, &both), 0.5);
        assert_relative_eq!(
            residual(SourceModel::RangingAndRssi, &candidate, &power),
            2.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            residual(SourceModel::Rssi, &candidate, &both),
            10. * 2. * 5f64.log10(),
            epsilon = 1e-12
        );
    }

    quickcheck! {
        fn iterations_stay_in_range(ratio: f64, size: u8) -> bool {
            let size = (size % 6) as usize + 1;
            let iterations = required_iterations(ratio.abs().fract(), size, 0.99, 1000);
            (1..=1000).contains(&iterations)
        }

        fn median_is_an_order_statistic(values: Vec<f64>) -> bool {
            let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
            let below = |m: f64| values.iter().filter(|v| **v <= m).count();
            values.is_empty() || below(median(values.clone())) * 2 >= values.len()
        }
    }
}
