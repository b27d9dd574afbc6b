use nalgebra::{Point2, Point3, point};
use radiolocate::{power::received_power_dbm, prelude::*};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rstest::rstest;
use std::{cell::RefCell, rc::Rc};
use uom::si::{f64::Frequency, frequency::gigahertz};

const READINGS: usize = 40;

struct Scene {
    truth: Point2<f64>,
    readings: Vec<Reading<2>>,
    quality: Vec<f64>,
    outliers: Vec<bool>,
}

fn access_point() -> RadioSource {
    RadioSource::wifi_access_point("3c:22:fb:12:34:56", Frequency::new::<gigahertz>(5.18))
}

/// Ranging readings around a random source. Every fifth reading is an
/// outlier when `outliers` is set, and outliers get lower quality scores.
fn ranging_scene(seed: u64, outliers: bool) -> Scene {
    let mut rng = StdRng::seed_from_u64(seed);
    let truth = point![rng.random_range(-20.0..20.0), rng.random_range(-20.0..20.0)];

    let mut scene = Scene {
        truth,
        readings: Vec::new(),
        quality: Vec::new(),
        outliers: Vec::new(),
    };
    for i in 0..READINGS {
        let observer = point![rng.random_range(-50.0..50.0), rng.random_range(-50.0..50.0)];
        let outlier = outliers && i % 5 == 0;
        let error = match outlier {
            true => rng.random_range(5.0..25.0),
            false => 0.0,
        };

        let distance = nalgebra::distance(&observer, &truth) + error;
        scene
            .readings
            .push(Reading::ranging(access_point(), observer, distance).unwrap());
        scene.quality.push(match outlier {
            true => rng.random_range(0.0..0.6),
            false => rng.random_range(0.4..1.0),
        });
        scene.outliers.push(outlier);
    }
    scene
}

fn robust_estimator(
    scene: &Scene,
    model: SourceModel,
    method: RobustMethod,
    seed: u64,
) -> RobustEstimator<'_, 2> {
    let mut estimator = RobustEstimator::new(model, method);
    estimator.set_readings(&scene.readings).unwrap();
    estimator.set_quality_scores(scene.quality.clone()).unwrap();
    estimator.set_seed(Some(seed)).unwrap();
    estimator
}

#[rstest]
#[case(RobustMethod::Ransac)]
#[case(RobustMethod::Lmeds)]
#[case(RobustMethod::Msac)]
#[case(RobustMethod::Prosac)]
#[case(RobustMethod::Promeds)]
fn recovers_source_without_outliers(#[case] method: RobustMethod) {
    let scene = ranging_scene(7, false);
    let mut estimator = robust_estimator(&scene, SourceModel::Ranging, method, 7);

    let estimate = estimator.estimate().unwrap();
    assert!(nalgebra::distance(estimate.position(), &scene.truth) < 1e-6);
    assert!(estimate.covariance().is_some());
    assert_eq!(estimator.inliers_data().unwrap().num_inliers(), READINGS);
}

#[rstest]
#[case(RobustMethod::Ransac)]
#[case(RobustMethod::Lmeds)]
#[case(RobustMethod::Msac)]
#[case(RobustMethod::Prosac)]
#[case(RobustMethod::Promeds)]
fn tolerates_outliers(#[case] method: RobustMethod) {
    let recovered = (0..10)
        .filter(|seed| {
            let scene = ranging_scene(*seed, true);
            let mut estimator = robust_estimator(&scene, SourceModel::Ranging, method, *seed);
            let Ok(estimate) = estimator.estimate() else {
                return false;
            };

            let close = nalgebra::distance(estimate.position(), &scene.truth) < 1e-6;
            let inliers = estimator.inliers_data().unwrap().inliers();
            close && inliers.iter().zip(&scene.outliers).all(|(i, o)| *i != *o)
        })
        .count();

    assert!(recovered >= 6, "recovered {recovered} of 10");
}

#[test]
fn joint_estimator_is_biased_by_outliers() {
    let recovered = (0..10)
        .filter(|seed| {
            let scene = ranging_scene(*seed, true);
            let mut estimator = JointEstimator::new(SourceModel::Ranging);
            estimator.set_readings(&scene.readings).unwrap();
            estimator
                .estimate()
                .is_ok_and(|estimate| nalgebra::distance(estimate.position(), &scene.truth) < 1e-6)
        })
        .count();

    assert!(recovered <= 2, "recovered {recovered} of 10");
}

#[rstest]
#[case(RobustMethod::Ransac)]
#[case(RobustMethod::Lmeds)]
#[case(RobustMethod::Msac)]
#[case(RobustMethod::Prosac)]
#[case(RobustMethod::Promeds)]
fn rssi_with_known_power(#[case] method: RobustMethod) {
    let mut rng = StdRng::seed_from_u64(21);
    let truth = point![4.0, -3.0];
    let readings: Vec<Reading<2>> = (0..20)
        .map(|_| {
            let observer: Point2<f64> =
                point![rng.random_range(-30.0..30.0), rng.random_range(-30.0..30.0)];
            let rssi = received_power_dbm(-38.0, nalgebra::distance(&observer, &truth), 2.0);
            Reading::rssi(access_point(), observer, rssi).unwrap()
        })
        .collect();
    let quality: Vec<f64> = (0..readings.len()).map(|_| rng.random_range(0.0..1.0)).collect();

    let mut estimator = RobustEstimator::new(SourceModel::Rssi, method);
    estimator.set_readings(&readings).unwrap();
    estimator.set_quality_scores(quality).unwrap();
    estimator.set_transmitted_power_estimated(false).unwrap();
    estimator.set_initial_transmitted_power_dbm(Some(-38.0)).unwrap();
    estimator.set_seed(Some(1)).unwrap();

    estimator.estimate().unwrap();
    assert!(nalgebra::distance(estimator.estimated_position().unwrap(), &truth) < 1e-6);
    assert_eq!(estimator.estimated_transmitted_power_dbm(), Some(-38.0));
    assert_eq!(estimator.estimated_transmitted_power_variance(), None);

    let located = estimator.estimated_radio_source().unwrap();
    assert_eq!(located.source().kind(), SourceKind::WifiAccessPoint);
    assert_eq!(located.path_loss_exponent(), Some(2.0));
}

/// Readings that carry a distance, a received power or both, cycling
/// through the three kinds. Every fifth reading is corrupted on every
/// channel it carries.
fn mixed_scene(seed: u64, tx: f64, exponent: f64) -> Scene {
    let mut rng = StdRng::seed_from_u64(seed);
    let truth = point![rng.random_range(-20.0..20.0), rng.random_range(-20.0..20.0)];

    let mut scene = Scene {
        truth,
        readings: Vec::new(),
        quality: Vec::new(),
        outliers: Vec::new(),
    };
    for i in 0..READINGS {
        let observer: Point2<f64> =
            point![rng.random_range(-50.0..50.0), rng.random_range(-50.0..50.0)];
        let outlier = i % 5 == 0;
        let (distance_error, rssi_error) = match outlier {
            true => (rng.random_range(5.0..25.0), rng.random_range(10.0..20.0)),
            false => (0.0, 0.0),
        };

        let distance = nalgebra::distance(&observer, &truth);
        let rssi = received_power_dbm(tx, distance, exponent) - rssi_error;
        let reading = match i % 3 {
            0 => Reading::ranging(access_point(), observer, distance + distance_error),
            1 => Reading::rssi(access_point(), observer, rssi),
            _ => Reading::ranging_and_rssi(access_point(), observer, distance + distance_error, rssi),
        };
        scene.readings.push(reading.unwrap());
        scene.quality.push(match outlier {
            true => rng.random_range(0.0..0.6),
            false => rng.random_range(0.4..1.0),
        });
        scene.outliers.push(outlier);
    }
    scene
}

#[rstest]
#[case(false, false, RobustMethod::Ransac)]
#[case(true, false, RobustMethod::Msac)]
#[case(false, true, RobustMethod::Prosac)]
#[case(true, true, RobustMethod::Msac)]
#[case(false, false, RobustMethod::Lmeds)]
#[case(true, false, RobustMethod::Promeds)]
fn mixed_readings_with_outliers(
    #[case] power: bool,
    #[case] exponent: bool,
    #[case] method: RobustMethod,
) {
    let recovered = (0..10)
        .filter(|seed| {
            let scene = mixed_scene(*seed, -40.0, 2.4);
            let mut estimator = robust_estimator(&scene, SourceModel::RangingAndRssi, method, *seed);
            estimator
                .set_targets(
                    Targets::position_only()
                        .with_transmitted_power(power)
                        .with_path_loss_exponent(exponent),
                )
                .unwrap();
            if !power {
                estimator.set_initial_transmitted_power_dbm(Some(-40.0)).unwrap();
            }
            if !exponent {
                estimator.set_initial_path_loss_exponent(2.4).unwrap();
            }
            assert!(estimator.is_ready());

            let Ok(estimate) = estimator.estimate() else {
                return false;
            };
            let close = nalgebra::distance(estimate.position(), &scene.truth) < 1e-6
                && estimate
                    .transmitted_power_dbm()
                    .is_some_and(|tx| (tx + 40.0).abs() < 1e-6)
                && estimate
                    .path_loss_exponent()
                    .is_some_and(|n| (n - 2.4).abs() < 1e-6);
            let inliers = estimator.inliers_data().unwrap().inliers();
            close && inliers.iter().zip(&scene.outliers).all(|(i, o)| *i != *o)
        })
        .count();

    assert!(recovered >= 6, "recovered {recovered} of 10");
}

#[rstest]
#[case(RobustMethod::Ransac)]
#[case(RobustMethod::Lmeds)]
#[case(RobustMethod::Msac)]
#[case(RobustMethod::Prosac)]
#[case(RobustMethod::Promeds)]
fn ranging_only_readings_in_mixed_model(#[case] method: RobustMethod) {
    let scene = ranging_scene(11, false);
    let mut estimator = robust_estimator(&scene, SourceModel::RangingAndRssi, method, 1);
    estimator.set_targets(Targets::position_only()).unwrap();
    estimator.set_initial_transmitted_power_dbm(Some(-40.0)).unwrap();
    assert!(estimator.is_ready());

    let estimate = estimator.estimate().unwrap();
    assert!(nalgebra::distance(estimate.position(), &scene.truth) < 1e-6);
    assert_eq!(estimate.transmitted_power_dbm(), Some(-40.0));
    assert_eq!(estimate.transmitted_power_variance(), None);
    assert_eq!(estimate.covariance().unwrap().shape(), (2, 2));
}

#[test]
fn ranging_3d_with_outliers() {
    let mut rng = StdRng::seed_from_u64(99);
    let truth = point![3.0, 1.0, 2.5];
    let readings: Vec<Reading<3>> = (0..30)
        .map(|i| {
            let observer: Point3<f64> = point![
                rng.random_range(-20.0..20.0),
                rng.random_range(-20.0..20.0),
                rng.random_range(0.0..5.0)
            ];
            let error = match i % 6 {
                0 => rng.random_range(3.0..10.0),
                _ => 0.0,
            };
            Reading::ranging(access_point(), observer, nalgebra::distance(&observer, &truth) + error)
                .unwrap()
        })
        .collect();

    let config = RobustConfig {
        seed: Some(4),
        linear_solver: LinearSolver::Homogeneous,
        ..Default::default()
    };
    let mut estimator =
        RobustEstimator::with_config(SourceModel::Ranging, RobustMethod::Msac, config).unwrap();
    estimator.set_readings(&readings).unwrap();

    estimator.estimate().unwrap();
    assert!(nalgebra::distance(estimator.estimated_position().unwrap(), &truth) < 1e-6);
    assert_eq!(estimator.inliers_data().unwrap().num_inliers(), 25);
    assert_eq!(estimator.estimated_position_covariance().unwrap().shape(), (3, 3));
}

#[test]
fn seeded_runs_are_reproducible() {
    let scene = ranging_scene(3, true);
    let mut first = robust_estimator(&scene, SourceModel::Ranging, RobustMethod::Ransac, 17);
    let mut second = robust_estimator(&scene, SourceModel::Ranging, RobustMethod::Ransac, 17);

    assert_eq!(
        first.estimate().unwrap().clone(),
        second.estimate().unwrap().clone()
    );
    assert_eq!(first.inliers_data(), second.inliers_data());
}

#[derive(Default)]
struct Events {
    starts: usize,
    ends: usize,
}

impl<'a> EstimatorListener<RobustEstimator<'a, 2>> for Events {
    fn on_estimate_start(&mut self, _estimator: &mut RobustEstimator<'a, 2>) {
        self.starts += 1;
    }

    fn on_estimate_end(&mut self, _estimator: &mut RobustEstimator<'a, 2>) {
        self.ends += 1;
    }
}

#[test]
fn failed_refinement_keeps_unrefined_candidate() {
    let mut rng = StdRng::seed_from_u64(8);
    let truth = point![0.0, 0.0];
    let readings: Vec<Reading<2>> = (0..15)
        .map(|_| {
            let observer: Point2<f64> =
                point![rng.random_range(-30.0..30.0), rng.random_range(-30.0..30.0)];
            let distance = nalgebra::distance(&observer, &truth) + rng.random_range(-0.05..0.05);
            Reading::ranging(access_point(), observer, distance).unwrap()
        })
        .collect();

    let events = Rc::new(RefCell::new(Events::default()));
    let mut estimator = RobustEstimator::new(SourceModel::Ranging, RobustMethod::Ransac);
    estimator.set_readings(&readings).unwrap();
    estimator.set_threshold(0.5).unwrap();
    estimator.set_seed(Some(2)).unwrap();
    estimator
        .set_refinement(RefinementConfig {
            max_iterations: 1,
            ..Default::default()
        })
        .unwrap();
    estimator.set_listener(events.clone()).unwrap();

    assert!(matches!(
        estimator.estimate(),
        Err(Error::RefinementFailed(_))
    ));
    assert!(nalgebra::distance(estimator.estimated_position().unwrap(), &truth) < 2.0);
    assert_eq!(estimator.estimated_covariance(), None);
    assert!(estimator.inliers_data().is_some());
    assert_eq!((events.borrow().starts, events.borrow().ends), (1, 1));
    assert!(!estimator.is_locked());
}
