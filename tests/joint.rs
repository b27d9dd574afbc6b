use approx::assert_relative_eq;
use nalgebra::{Matrix2, Point2, point};
use radiolocate::{power::received_power_dbm, prelude::*};
use rand::{Rng, SeedableRng, rngs::StdRng};
use uom::si::{f64::Frequency, frequency::gigahertz};

fn beacon() -> RadioSource {
    RadioSource::beacon("beacon-42", Frequency::new::<gigahertz>(2.402))
}

fn grid() -> Vec<Point2<f64>> {
    (0..5)
        .flat_map(|i| (0..5).map(move |j| point![i as f64 * 10.0, j as f64 * 10.0]))
        .collect()
}

#[test]
fn rssi_recovers_power_and_exponent() {
    let truth = point![17.0, 23.0];
    let readings: Vec<Reading<2>> = grid()
        .into_iter()
        .map(|p| {
            let rssi = received_power_dbm(-45.0, nalgebra::distance(&p, &truth), 2.7);
            Reading::rssi(beacon(), p, rssi).unwrap()
        })
        .collect();

    let mut estimator = JointEstimator::new(SourceModel::Rssi);
    estimator.set_readings(&readings).unwrap();
    estimator.set_path_loss_exponent_estimated(true).unwrap();
    estimator.set_initial_position(Some(point![20.0, 20.0])).unwrap();
    estimator.set_initial_transmitted_power_dbm(Some(-40.0)).unwrap();
    estimator.set_initial_path_loss_exponent(2.5).unwrap();

    let estimate = estimator.estimate().unwrap();
    assert_relative_eq!(*estimate.position(), truth, epsilon = 1e-6);
    assert_relative_eq!(estimate.transmitted_power_dbm().unwrap(), -45.0, epsilon = 1e-6);
    assert_relative_eq!(estimate.path_loss_exponent().unwrap(), 2.7, epsilon = 1e-6);
    assert_eq!(estimate.covariance().unwrap().shape(), (4, 4));
}

#[test]
fn noisy_ranging_covariance_matches_noise() {
    let mut rng = StdRng::seed_from_u64(5);
    let truth = point![21.0, 18.0];
    let noise = 0.2;
    let readings: Vec<Reading<2>> = grid()
        .into_iter()
        .map(|p| {
            let distance = nalgebra::distance(&p, &truth) + rng.random_range(-noise..noise);
            Reading::ranging(beacon(), p, distance)
                .and_then(|r| r.with_distance_std(noise))
                .unwrap()
        })
        .collect();

    let mut estimator = JointEstimator::new(SourceModel::Ranging);
    estimator.set_readings(&readings).unwrap();
    estimator.estimate().unwrap();

    let position = estimator.estimated_position().unwrap();
    assert!(nalgebra::distance(position, &truth) < 0.3);

    // 25 readings with 0.2 m noise in two dimensions.
    let covariance = estimator.estimated_position_covariance().unwrap();
    assert!(covariance[(0, 0)] > 1e-4 && covariance[(0, 0)] < 1e-2);
    assert!(covariance[(1, 1)] > 1e-4 && covariance[(1, 1)] < 1e-2);
}

#[test]
fn observer_uncertainty_widens_covariance() {
    let truth = point![21.0, 18.0];
    let build = |covariance: Option<Matrix2<f64>>| -> Vec<Reading<2>> {
        grid()
            .into_iter()
            .map(|p| {
                let reading = Reading::ranging(beacon(), p, nalgebra::distance(&p, &truth))
                    .and_then(|r| r.with_distance_std(0.1))
                    .unwrap();
                match covariance {
                    Some(covariance) => reading.with_position_covariance(covariance).unwrap(),
                    None => reading,
                }
            })
            .collect()
    };

    let exact = build(None);
    let uncertain = build(Some(Matrix2::identity()));

    let variance = |readings: &[Reading<2>], use_position_covariance: bool| {
        let config = JointConfig {
            refinement: RefinementConfig {
                use_position_covariance,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut estimator = JointEstimator::with_config(SourceModel::Ranging, config).unwrap();
        estimator.set_readings(readings).unwrap();
        estimator.estimate().unwrap();
        estimator.estimated_position_covariance().unwrap()[(0, 0)]
    };

    let base = variance(&exact, true);
    assert!(variance(&uncertain, true) > 10. * base);
    assert_relative_eq!(variance(&uncertain, false), base, max_relative = 1e-6);
}
