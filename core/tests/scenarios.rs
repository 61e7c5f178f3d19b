//! End-to-end scenarios for the fusion pipeline.
//!
//! Each test replays a synthetic sensor sequence through the full driver
//! (alignment, predict, GNSS/odometry updates) and checks the estimate
//! against the trajectory the sequence was generated from. GNSS fixes are
//! produced by inverse-projecting local metric positions around a base
//! geodetic point, so the geodetic round trip is part of every scenario.

use std::sync::Arc;

use assert_approx_eq::assert_approx_eq;
use nalgebra::Vector3;

use gins::earth::{self, STANDARD_GRAVITY};
use gins::fusion::Fusion;
use gins::gnss::{GnssReading, GnssStatus, UtmCoordinate};
use gins::messages::SensorRecord;
use gins::sink::SharedSink;
use gins::{FilterConfig, ImuSample, OdomSample};

const BASE_LAT: f64 = 48.0;
const BASE_LON: f64 = 11.0;
const BASE_ALT: f64 = 500.0;
const IMU_DT: f64 = 0.01;
const GNSS_EVERY: usize = 10;

/// A GNSS reading for a local ENU offset from the base point.
fn gnss_at(time: f64, east: f64, north: f64, up: f64) -> GnssReading {
    let base = earth::lat_lon_to_utm(BASE_LAT, BASE_LON).unwrap();
    let shifted = UtmCoordinate {
        easting: base.easting + east,
        northing: base.northing + north,
        ..base
    };
    let (lat, lon) = earth::utm_to_lat_lon(&shifted).unwrap();
    GnssReading {
        time,
        status: GnssStatus::FixedRtk,
        lat_lon_alt: Vector3::new(lat, lon, BASE_ALT + up),
        heading_deg: 0.0,
        heading_valid: false,
    }
}

fn static_imu(time: f64) -> ImuSample {
    ImuSample {
        time,
        gyro: Vector3::zeros(),
        accel: Vector3::new(0.0, 0.0, STANDARD_GRAVITY),
    }
}

fn new_driver(config: FilterConfig) -> Fusion {
    Fusion::new(config, Arc::new(SharedSink::new())).unwrap()
}

/// S1: pure static alignment.
#[test]
fn s1_static_alignment() {
    let mut fusion = new_driver(FilterConfig::default());
    for i in 0..200 {
        fusion
            .process(&SensorRecord::Imu(static_imu(i as f64 * IMU_DT)))
            .unwrap();
    }
    assert!(fusion.initialized());
    let s = fusion.nav_state();
    assert!(s.velocity.norm() < 1e-6);
    assert!(s.rotation.angle() < 1e-4);
    assert!(s.gyro_bias.norm() < 1e-4);
    assert_approx_eq!(s.gravity.z, -STANDARD_GRAVITY, 1e-3);
    assert_approx_eq!(s.gravity.x, 0.0, 1e-3);
}

/// Drives one constant-velocity-east run: 2 s static lead-in for alignment,
/// 1 s of acceleration to 5 m/s starting at t = 2.5, then cruise until
/// `duration`. GNSS at 10 Hz,
/// withheld inside `outage`; wheel odometry fed at 10 Hz (consumed only when
/// the config enables it); an accelerometer disturbance `imu_bias_x` is
/// applied inside the outage window. Returns the per-sample position errors
/// inside the outage window, the error at GNSS resume, and the error one
/// second after resume.
struct RunSummary {
    final_velocity: Vector3<f64>,
    final_position_error: f64,
    outage_errors: Vec<f64>,
    error_at_resume: f64,
    /// Position error three GNSS updates (0.3 s) after fixes resume.
    error_after_three: f64,
    /// Position error one second after fixes resume.
    error_after_resume: f64,
}

fn run_east_profile(
    config: FilterConfig,
    duration: f64,
    outage: Option<(f64, f64)>,
    imu_bias_x: f64,
) -> RunSummary {
    // Alignment completes at t = 1.99 and the filter clock re-latches on the
    // next sample, so the acceleration phase starts strictly after that.
    let accel_start = 2.5;
    let accel_end = 3.5;
    let cruise = 5.0;
    let circumference = config.wheel_circumference();
    let pulses_per_rev = config.pulses_per_rev;

    let mut fusion = new_driver(config);

    // truth, integrated with the same scheme as the filter
    let mut true_pos = 0.0_f64;
    let mut true_vel = 0.0_f64;

    let steps = (duration / IMU_DT).round() as usize;
    let mut outage_errors = Vec::new();
    let mut error_at_resume = f64::NAN;
    let mut resume_time = f64::NAN;
    let mut error_after_three = f64::NAN;
    let mut error_after_resume = f64::NAN;

    for i in 0..=steps {
        let t = i as f64 * IMU_DT;
        let accel_x = if (accel_start..accel_end).contains(&t) {
            cruise / (accel_end - accel_start)
        } else {
            0.0
        };

        let in_outage = outage.is_some_and(|(a, b)| (a..b).contains(&t));
        let disturbance = if in_outage { imu_bias_x } else { 0.0 };
        let imu = ImuSample {
            time: t,
            gyro: Vector3::zeros(),
            accel: Vector3::new(accel_x + disturbance, 0.0, STANDARD_GRAVITY),
        };
        fusion.process(&SensorRecord::Imu(imu)).unwrap();

        if i > 0 {
            true_pos += true_vel * IMU_DT + 0.5 * accel_x * IMU_DT * IMU_DT;
            true_vel += accel_x * IMU_DT;
        }

        if fusion.initialized() {
            let err = (fusion.nav_state().position - Vector3::new(true_pos, 0.0, 0.0)).norm();
            if in_outage {
                outage_errors.push(err);
            }
            if let Some((_, end)) = outage {
                if t >= end && error_at_resume.is_nan() {
                    error_at_resume = err;
                    resume_time = t;
                }
                if !resume_time.is_nan() {
                    if t >= resume_time + 0.3 && error_after_three.is_nan() {
                        error_after_three = err;
                    }
                    if t >= resume_time + 1.0 && error_after_resume.is_nan() {
                        error_after_resume = err;
                    }
                }
            }
        }

        if i % GNSS_EVERY == 0 && !in_outage {
            fusion
                .process(&SensorRecord::Gnss(gnss_at(t, true_pos, 0.0, 0.0)))
                .unwrap();
        }
        if i % GNSS_EVERY == 5 {
            // true speed encoded as equal left/right pulses over 0.1 s
            let pulses = true_vel * pulses_per_rev * (GNSS_EVERY as f64 * IMU_DT) / circumference;
            fusion
                .process(&SensorRecord::Odom(OdomSample {
                    time: t,
                    left_pulse: pulses,
                    right_pulse: pulses,
                }))
                .unwrap();
        }
    }

    let s = fusion.nav_state();
    RunSummary {
        final_velocity: s.velocity,
        final_position_error: (s.position - Vector3::new(true_pos, 0.0, 0.0)).norm(),
        outage_errors,
        error_at_resume,
        error_after_three,
        error_after_resume,
    }
}

fn rms(errors: &[f64]) -> f64 {
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len().max(1) as f64).sqrt()
}

/// S2: constant velocity east under continuous GNSS.
#[test]
fn s2_constant_velocity_east() {
    let summary = run_east_profile(FilterConfig::default(), 13.0, None, 0.0);
    assert_approx_eq!(summary.final_velocity.x, 5.0, 0.05);
    assert!(summary.final_velocity.y.abs() < 0.05);
    assert!(
        summary.final_position_error < 0.2,
        "position error {:.3} m",
        summary.final_position_error
    );
}

/// S3: a 2 s GNSS outage mid-run; drift stays bounded and the filter
/// reconverges quickly once fixes resume.
#[test]
fn s3_gnss_outage_recovery() {
    let summary = run_east_profile(FilterConfig::default(), 13.0, Some((6.0, 8.0)), 0.0);
    let worst = summary
        .outage_errors
        .iter()
        .cloned()
        .fold(0.0_f64, f64::max);
    assert!(worst < 0.5, "drift during outage reached {worst:.3} m");
    assert!(
        summary.error_after_resume < 0.2,
        "error {:.3} m one second after resume",
        summary.error_after_resume
    );
    assert_approx_eq!(summary.final_velocity.x, 5.0, 0.05);
}

/// S4: with a disturbed accelerometer during the outage, wheel odometry must
/// cut the outage position error substantially.
#[test]
fn s4_odometry_bounds_outage_drift() {
    let mut without = FilterConfig::default();
    without.sigma_odom_v = 0.02;
    let mut with = without.clone();
    with.with_odom = true;

    let base = run_east_profile(without, 13.0, Some((6.0, 8.0)), 0.1);
    let aided = run_east_profile(with, 13.0, Some((6.0, 8.0)), 0.1);

    let base_rms = rms(&base.outage_errors);
    let aided_rms = rms(&aided.outage_errors);
    assert!(
        aided_rms < 0.7 * base_rms,
        "odometry did not help: {aided_rms:.3} m vs {base_rms:.3} m"
    );
}

/// After a long outage with a disturbed accelerometer, the position error
/// collapses by more than 90 % within three resumed fixes: the covariance
/// grown during the outage makes the first updates near-deadbeat.
#[test]
fn residual_drops_sharply_when_fixes_resume() {
    let summary = run_east_profile(FilterConfig::default(), 20.0, Some((6.0, 16.0)), 0.1);
    assert!(
        summary.error_at_resume > 1.0,
        "outage produced too little drift ({:.3} m) to measure recovery",
        summary.error_at_resume
    );
    assert!(
        summary.error_after_three < 0.1 * summary.error_at_resume,
        "error {:.3} m after three fixes (was {:.3} m)",
        summary.error_after_three,
        summary.error_at_resume
    );
}

/// S5: a GNSS reading arriving behind the propagated state is dropped without
/// touching the filter.
#[test]
fn s5_out_of_order_gnss_is_dropped() {
    let mut fusion = new_driver(FilterConfig::default());
    for i in 0..300 {
        let t = i as f64 * IMU_DT;
        fusion.process(&SensorRecord::Imu(static_imu(t))).unwrap();
        if i % GNSS_EVERY == 0 {
            fusion
                .process(&SensorRecord::Gnss(gnss_at(t, 0.0, 0.0, 0.0)))
                .unwrap();
        }
    }
    assert!(fusion.initialized());
    let before = fusion.nav_state();
    let dropped = fusion.dropped_records();

    // 0.1 s behind the filter clock, beyond the 50 ms tolerance
    fusion
        .process(&SensorRecord::Gnss(gnss_at(2.99 - 0.1, 25.0, 25.0, 5.0)))
        .unwrap();

    let after = fusion.nav_state();
    assert_eq!(fusion.dropped_records(), dropped + 1);
    assert!((after.position - before.position).norm() < 1e-15);
    assert!((after.velocity - before.velocity).norm() < 1e-15);
    assert!((after.rotation.inverse() * before.rotation).angle() < 1e-15);
}

/// The filter stays consistent through a long run with an outage in the
/// middle.
#[test]
fn long_run_stays_consistent() {
    let summary = run_east_profile(FilterConfig::default(), 30.0, Some((12.0, 14.0)), 0.0);
    assert!(summary.final_position_error < 0.2);
    assert_approx_eq!(summary.final_velocity.x, 5.0, 0.05);
}
