//! End-to-end tests for the DVL/IMU navigation filter.
//!
//! These tests drive the public API the way the command line tool does: synthesize or load a
//! log, play it through [`run_filter`], and compare the estimates with the known ground truth of
//! the scenario. The tolerances are empirical regression bounds, not design goals.

use assert_approx_eq::assert_approx_eq;
use tempfile::NamedTempFile;

use dvlnav::config::{FailurePolicy, FilterConfig};
use dvlnav::filter::DvlEngine;
use dvlnav::sim::{
    NO_LOCK, Scenario, read_log, read_results, run_filter, synthesize, write_log, write_results,
};
use dvlnav::{DvlFilter, DvlModel, FilterError, NavigationState, ObservationIndex, StateVector};

#[test]
fn constant_forward_acceleration_is_tracked() {
    let scenario = Scenario {
        samples: 150,
        delta_time: 0.2,
        acceleration: [0.1, 0.0, 0.0],
        sounding: 10.0,
        ..Scenario::default()
    };
    let records = synthesize(&scenario, 0).unwrap();
    let results = run_filter(&records, &FilterConfig::default()).unwrap();
    assert_eq!(results.len(), scenario.samples);
    assert!(results.iter().all(|r| r.accepted));

    for pair in results.windows(2) {
        assert!(
            pair[1].vel_x >= pair[0].vel_x - 1e-6,
            "vel_x decreased at sample {}: {} -> {}",
            pair[1].sample,
            pair[0].vel_x,
            pair[1].vel_x
        );
    }

    // once settled, every estimate stays near the truth, not just the last one
    const SETTLED: usize = 30;
    let truth = scenario.true_velocities();
    for (result, v) in results.iter().zip(truth.iter()).skip(SETTLED) {
        assert!(
            (result.vel_x - v[0]).abs() < 0.05,
            "vel_x {} too far from truth {} at sample {}",
            result.vel_x,
            v[0],
            result.sample
        );
    }

    let last = results.last().unwrap();
    assert_approx_eq!(last.vel_y, 0.0, 0.05);
    assert_approx_eq!(last.vel_z, 0.0, 0.05);
    assert_approx_eq!(last.acc_x, 0.1, 0.01);
    assert_approx_eq!(last.sounding_z, 10.0, 0.05);
    assert_approx_eq!(last.delta_time, 0.2, 1e-6);
}

#[test]
fn noisy_log_with_dropouts_stays_close_to_truth() {
    let scenario = Scenario {
        samples: 300,
        acceleration: [0.05, -0.02, 0.0],
        initial_velocity: [0.5, 0.0, 0.0],
        sounding: 25.0,
        velocity_noise: 0.05,
        range_noise: 0.02,
        acceleration_noise: 0.01,
        beam_dropout: 0.3,
        imu_dropout: 0.1,
        ..Scenario::default()
    };
    let records = synthesize(&scenario, 1234).unwrap();
    assert!(records.iter().any(|r| r.status_bow == NO_LOCK));
    assert!(records.iter().any(|r| r.imu_ok != 0));

    let results = run_filter(&records, &FilterConfig::default()).unwrap();
    assert!(results.iter().all(|r| r.accepted));
    let truth = scenario.true_velocities();
    let last = results.last().unwrap();
    let v = truth.last().unwrap();
    assert_approx_eq!(last.vel_x, v[0], 0.15);
    assert_approx_eq!(last.vel_y, v[1], 0.15);
    assert_approx_eq!(last.sounding_z, 25.0, 0.3);
}

#[test]
fn unlocked_beam_values_are_ignored() {
    let scenario = Scenario {
        samples: 80,
        initial_velocity: [1.0, 0.0, 0.0],
        ..Scenario::default()
    };
    let clean = synthesize(&scenario, 0).unwrap();
    let mut corrupted = clean.clone();
    for record in corrupted.iter_mut() {
        record.status_bow = 'V';
        record.vel_bow = 1000.0;
        record.range_bow = f64::NAN;
    }

    let config = FilterConfig::default();
    let reference = run_filter(&clean, &config).unwrap();
    let degraded = run_filter(&corrupted, &config).unwrap();
    assert!(degraded.iter().all(|r| r.accepted));
    let (a, b) = (reference.last().unwrap(), degraded.last().unwrap());
    assert_approx_eq!(a.vel_x, b.vel_x, 1e-3);
    assert_approx_eq!(a.sounding_z, b.sounding_z, 1e-3);
}

#[test]
fn imu_fault_ignores_garbage_attitude() {
    let mut records = synthesize(&Scenario { samples: 20, ..Scenario::default() }, 0).unwrap();
    records[10].imu_ok = 5;
    records[10].roll = f64::NAN;
    records[10].acc_longitudinal = f64::INFINITY;
    let results = run_filter(&records, &FilterConfig::default()).unwrap();
    assert!(results.iter().all(|r| r.accepted));
    assert!(results[10].rot_qr.is_finite());
}

#[test]
fn singular_innovation_is_reported_and_recoverable() {
    let records = synthesize(&Scenario { samples: 5, ..Scenario::default() }, 0).unwrap();
    let config = FilterConfig::default();
    let observation = config.trust.assess(&records[0].to_sample());

    // an unbounded prior makes the innovation covariance unusable
    let initial = StateVector::from(NavigationState::default());
    let mut engine = DvlEngine::new(
        DvlModel::default(),
        initial,
        StateVector::from_element(f64::INFINITY),
    );
    engine.set_measurement_variances(&observation.variances).unwrap();
    assert_eq!(
        engine.step(&observation.values),
        Err(FilterError::SingularInnovation)
    );
    assert_eq!(engine.get_estimate(), initial);

    engine.reset_covariance(&config.initial_covariance.diagonal());
    assert!(engine.step(&observation.values).is_ok());
}

#[test]
fn failed_steps_follow_the_failure_policy() {
    let mut records = synthesize(&Scenario { samples: 12, ..Scenario::default() }, 0).unwrap();
    records[3].range_port = f64::NAN;
    records[7].vel_stern = f64::INFINITY;
    let mut config = FilterConfig::default();

    for policy in [FailurePolicy::Skip, FailurePolicy::ResetCovariance] {
        config.on_failure = policy;
        let results = run_filter(&records, &config).unwrap();
        let rejected: Vec<usize> = results.iter().filter(|r| !r.accepted).map(|r| r.sample).collect();
        assert_eq!(rejected, vec![3, 7]);
        assert_eq!(results[3].vel_x, results[2].vel_x);
    }

    config.on_failure = FailurePolicy::Abort;
    let err = run_filter(&records, &config).unwrap_err();
    assert!(format!("{:#}", err).contains("sample 3"));
    assert_eq!(
        err.downcast_ref::<FilterError>(),
        Some(&FilterError::NonFiniteObservation {
            index: ObservationIndex::RangePort as usize
        })
    );
}

#[test]
fn invalid_configuration_is_a_hard_error() {
    let records = synthesize(&Scenario { samples: 5, ..Scenario::default() }, 0).unwrap();
    let mut config = FilterConfig::default();
    config.trust.velocity = -1.0;
    config.mounting_angle_deg = 120.0;
    assert!(matches!(
        DvlFilter::new(&config),
        Err(FilterError::InvalidConfig { .. })
    ));
    assert!(run_filter(&records, &config).is_err());
}

#[test]
fn csv_pipeline_round_trip() {
    let scenario = Scenario {
        samples: 40,
        velocity_noise: 0.02,
        ..Scenario::default()
    };
    let records = synthesize(&scenario, 9).unwrap();

    let log_file = NamedTempFile::new().unwrap();
    write_log(&records, log_file.path()).unwrap();
    // append a truncated row, as a logger cut off mid-write would leave
    let mut text = std::fs::read_to_string(log_file.path()).unwrap();
    text.push_str("0.2,0,C,0.0,0.0\n");
    std::fs::write(log_file.path(), text).unwrap();

    let loaded = read_log(log_file.path()).unwrap();
    assert_eq!(loaded, records);

    let results = run_filter(&loaded, &FilterConfig::default()).unwrap();
    let out_file = NamedTempFile::new().unwrap();
    write_results(&results, out_file.path()).unwrap();
    let reread = read_results(out_file.path()).unwrap();
    assert_eq!(reread.len(), records.len());
    assert_eq!(reread, results);
}

#[test]
fn config_file_drives_the_filter() {
    let mut config = FilterConfig::default();
    config.mounting_angle_deg = 30.0;
    config.initial_state.sounding_z = 20.0;
    let f = NamedTempFile::new().unwrap();
    let path = f.path().with_extension("toml");
    config.to_file(&path).unwrap();
    let loaded = FilterConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);

    let scenario = Scenario {
        samples: 60,
        sounding: 20.0,
        mounting_angle_deg: 30.0,
        ..Scenario::default()
    };
    let records = synthesize(&scenario, 3).unwrap();
    let sin = 30.0_f64.to_radians().sin();
    assert_approx_eq!(records[0].range_bow, 20.0 / sin, 1e-9);

    let results = run_filter(&records, &loaded).unwrap();
    assert_approx_eq!(results.last().unwrap().sounding_z, 20.0, 0.05);
}
