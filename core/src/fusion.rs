//! Time-driven sensor fusion loop.
//!
//! A single thread owns the filter and consumes IMU, GNSS, and wheel-odometry
//! records in arrival order: IMU drives the predict step, prepared GNSS and
//! odometry drive updates. Before the filter runs, an initial-alignment stage
//! estimates the gyro bias, gravity, and tilt from a window of static IMU
//! samples. The driver also owns origin/zone latching, the static-motion
//! detector feeding ZUPTs, ordering enforcement, and divergence tracking.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{Isometry3, UnitQuaternion, Vector3};

use crate::config::FilterConfig;
use crate::earth::STANDARD_GRAVITY;
use crate::eskf::Eskf;
use crate::gnss::{self, GnssReading};
use crate::messages::SensorRecord;
use crate::sink::SharedSink;
use crate::state::NavState;
use crate::{FilterError, ImuSample, OdomSample};

/// Mean and per-axis variance of a set of vectors.
fn mean_and_variance(samples: impl Iterator<Item = Vector3<f64>> + Clone) -> (Vector3<f64>, Vector3<f64>) {
    let n = samples.clone().count().max(1) as f64;
    let mean = samples.clone().sum::<Vector3<f64>>() / n;
    let var = samples
        .map(|v| (v - mean).component_mul(&(v - mean)))
        .sum::<Vector3<f64>>()
        / (n - 1.0).max(1.0);
    (mean, var)
}

/// Result of the static initial alignment.
#[derive(Clone, Copy, Debug)]
pub struct Alignment {
    /// Tilt rotation taking the mean specific force to straight up.
    pub rotation: UnitQuaternion<f64>,
    /// Gyro bias estimate, the mean angular rate at rest.
    pub gyro_bias: Vector3<f64>,
    /// Gravity vector in the navigation frame, `(0, 0, -|g|)`.
    pub gravity: Vector3<f64>,
}

/// Accumulates IMU samples while the vehicle is known static and produces the
/// initial alignment.
///
/// Unless the configuration asserts a static start, the window is gated on
/// per-axis sample variance and restarts whenever motion is detected. If no
/// static window is found within the configured horizon the initializer
/// either aborts or falls back to an identity-attitude alignment.
pub struct StaticInitializer {
    assume_static: bool,
    target: usize,
    gyro_var_gate: f64,
    acc_var_gate: f64,
    horizon: f64,
    identity_fallback: bool,
    buffer: Vec<ImuSample>,
    start_time: Option<f64>,
}

impl StaticInitializer {
    pub fn new(config: &FilterConfig) -> Self {
        StaticInitializer {
            assume_static: config.assume_static_start,
            target: config.static_init_samples,
            gyro_var_gate: config.static_init_gyro_var,
            acc_var_gate: config.static_init_acc_var,
            horizon: config.init_horizon_s,
            identity_fallback: config.init_timeout_identity,
            buffer: Vec::with_capacity(config.static_init_samples),
            start_time: None,
        }
    }

    /// Feeds one IMU sample; returns the alignment once enough static samples
    /// have accumulated.
    pub fn try_add(&mut self, imu: &ImuSample) -> Result<Option<Alignment>, FilterError> {
        let start = *self.start_time.get_or_insert(imu.time);
        self.buffer.push(*imu);

        if self.buffer.len() < self.target {
            if imu.time - start > self.horizon {
                return self.timeout();
            }
            return Ok(None);
        }

        let (gyro_mean, gyro_var) = mean_and_variance(self.buffer.iter().map(|s| s.gyro));
        let (acc_mean, acc_var) = mean_and_variance(self.buffer.iter().map(|s| s.accel));

        if !self.assume_static
            && (gyro_var.max() > self.gyro_var_gate || acc_var.max() > self.acc_var_gate)
        {
            warn!(
                "motion during alignment at t={:.3} (gyro var {:.2e}, acc var {:.2e}), restarting window",
                imu.time,
                gyro_var.max(),
                acc_var.max()
            );
            self.buffer.clear();
            if imu.time - start > self.horizon {
                return self.timeout();
            }
            return Ok(None);
        }

        let gravity_norm =
            self.buffer.iter().map(|s| s.accel.norm()).sum::<f64>() / self.buffer.len() as f64;
        let up = Vector3::new(0.0, 0.0, gravity_norm);
        // Rotation taking the mean specific force to straight up; at rest the
        // accelerometer senses -g, so this levels the platform. Yaw stays
        // unobservable here and is left at zero.
        let rotation = UnitQuaternion::rotation_between(&acc_mean, &up)
            .unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI));

        Ok(Some(Alignment {
            rotation,
            gyro_bias: gyro_mean,
            gravity: Vector3::new(0.0, 0.0, -gravity_norm),
        }))
    }

    fn timeout(&mut self) -> Result<Option<Alignment>, FilterError> {
        if !self.identity_fallback {
            return Err(FilterError::Initialization(format!(
                "no static window within {:.1} s",
                self.horizon
            )));
        }
        warn!(
            "no static window within {:.1} s, proceeding with identity alignment",
            self.horizon
        );
        let gyro_bias = if self.buffer.len() > 1 {
            mean_and_variance(self.buffer.iter().map(|s| s.gyro)).0
        } else {
            Vector3::zeros()
        };
        Ok(Some(Alignment {
            rotation: UnitQuaternion::identity(),
            gyro_bias,
            gravity: Vector3::new(0.0, 0.0, -STANDARD_GRAVITY),
        }))
    }
}

/// The fusion driver: owns the filter, the alignment stage, and the dispatch
/// of the three sensor streams.
pub struct Fusion {
    config: FilterConfig,
    eskf: Eskf,
    initializer: StaticInitializer,
    initialized: bool,
    origin: Option<Vector3<f64>>,
    zone: Option<i32>,
    pending_init_pose: Option<(Isometry3<f64>, bool)>,
    motion_window: VecDeque<ImuSample>,
    zupt_pending: bool,
    last_odom_time: Option<f64>,
    sink: Arc<SharedSink>,
    dropped_records: usize,
    nan_strikes: u32,
    diverged: bool,
}

impl Fusion {
    /// Validates the configuration and builds an idle driver.
    pub fn new(config: FilterConfig, sink: Arc<SharedSink>) -> Result<Self, FilterError> {
        config.validate()?;
        let eskf = Eskf::new(config.tuning());
        let initializer = StaticInitializer::new(&config);
        let origin = config.map_origin.map(|o| Vector3::new(o[0], o[1], o[2]));
        let window = config.static_window;
        Ok(Fusion {
            config,
            eskf,
            initializer,
            initialized: false,
            origin,
            zone: None,
            pending_init_pose: None,
            motion_window: VecDeque::with_capacity(window + 1),
            zupt_pending: false,
            last_odom_time: None,
            sink,
            dropped_records: 0,
            nan_strikes: 0,
            diverged: false,
        })
    }

    /// Dispatches one record in arrival order.
    pub fn process(&mut self, record: &SensorRecord) -> Result<(), FilterError> {
        if self.diverged {
            return Err(FilterError::Diverged);
        }
        let strikes_before = self.nan_strikes;
        let result = match record {
            SensorRecord::Imu(imu) => self.handle_imu(imu),
            SensorRecord::Gnss(reading) => self.handle_gnss(reading),
            SensorRecord::Odom(odom) => self.handle_odom(odom),
        };
        // Only failures on consecutive records escalate to divergence.
        if result.is_ok() && self.nan_strikes == strikes_before {
            self.nan_strikes = 0;
        }
        result
    }

    /// Snapshot of the current nominal state.
    pub fn nav_state(&self) -> NavState {
        self.eskf.nominal_state()
    }

    /// True once initial alignment has completed.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// The latched (or configured) map origin, once known.
    pub fn origin(&self) -> Option<Vector3<f64>> {
        self.origin
    }

    /// Records dropped for ordering or conversion reasons so far.
    pub fn dropped_records(&self) -> usize {
        self.dropped_records
    }

    fn handle_imu(&mut self, imu: &ImuSample) -> Result<(), FilterError> {
        if !self.initialized {
            if let Some(alignment) = self.initializer.try_add(imu)? {
                self.finish_alignment(imu.time, alignment);
            }
            return Ok(());
        }

        let fire_zupt = self.zupt_pending;
        self.eskf.predict(imu);
        if self.config.with_zupt && fire_zupt {
            debug!("zero-velocity update at t={:.3}", imu.time);
            if let Err(e) = self.eskf.observe_zero_velocity(self.config.sigma_zupt) {
                self.numerical_failure(e)?;
            }
        }
        self.track_static_motion(imu);
        self.check_health()?;
        self.sink.update_nav_state(self.eskf.nominal_state());
        Ok(())
    }

    fn finish_alignment(&mut self, time: f64, alignment: Alignment) {
        let mut state = NavState {
            time,
            rotation: alignment.rotation,
            gravity: alignment.gravity,
            gyro_bias: alignment.gyro_bias,
            ..NavState::default()
        };
        if let Some((pose, heading_usable)) = self.pending_init_pose.take() {
            state.position = pose.translation.vector;
            if heading_usable {
                let (_, _, yaw) = pose.rotation.euler_angles();
                state.rotation =
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw) * alignment.rotation;
            }
        }
        info!(
            "alignment complete at t={time:.3}: bg=[{:.2e}, {:.2e}, {:.2e}], |g|={:.4}",
            alignment.gyro_bias.x,
            alignment.gyro_bias.y,
            alignment.gyro_bias.z,
            alignment.gravity.norm()
        );
        self.eskf.init(state, &self.config.initial_sigmas());
        self.initialized = true;
    }

    fn handle_gnss(&mut self, reading: &GnssReading) -> Result<(), FilterError> {
        // Ordering gate: a reading too far behind the propagated state is
        // dropped without touching the filter.
        if let Some(last_t) = self.eskf.last_time() {
            if reading.time < last_t - self.config.tau_back_s {
                warn!(
                    "dropping out-of-order GNSS at t={:.3} (filter at t={last_t:.3})",
                    reading.time
                );
                self.dropped_records += 1;
                return Ok(());
            }
        }

        if self.origin.is_none() || self.zone.is_none() {
            match gnss::prepare_translation_only(reading) {
                Ok(utm) => {
                    let origin = self
                        .origin
                        .unwrap_or_else(|| Vector3::new(utm.easting, utm.northing, utm.z));
                    info!(
                        "latched map origin ({:.3}, {:.3}, {:.3}) in UTM zone {}{}",
                        origin.x,
                        origin.y,
                        origin.z,
                        utm.zone,
                        if utm.north { 'N' } else { 'S' }
                    );
                    self.origin = Some(origin);
                    self.zone = Some(utm.zone);
                }
                Err(e) => {
                    warn!("skipping unusable GNSS at t={:.3}: {e}", reading.time);
                    self.dropped_records += 1;
                    return Ok(());
                }
            }
        }

        let origin = self.origin.expect("origin latched above");
        let prepared = match gnss::prepare(reading, &self.config.antenna(), &origin, self.zone) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("skipping unusable GNSS at t={:.3}: {e}", reading.time);
                self.dropped_records += 1;
                return Ok(());
            }
        };
        if !prepared.utm_valid {
            self.dropped_records += 1;
            return Ok(());
        }

        self.sink.update_gps_pose(prepared.pose);

        if !self.initialized {
            // Remember the fix so alignment can start from it.
            self.pending_init_pose = Some((prepared.pose, prepared.heading_usable));
            return Ok(());
        }

        if let Err(e) = self.eskf.observe_pose(
            &prepared.pose,
            self.config.sigma_gnss_pos,
            self.config.sigma_gnss_heading(),
            prepared.heading_usable,
        ) {
            self.numerical_failure(e)?;
        }
        self.check_health()?;
        self.sink.update_nav_state(self.eskf.nominal_state());
        Ok(())
    }

    fn handle_odom(&mut self, odom: &OdomSample) -> Result<(), FilterError> {
        let last = self.last_odom_time.replace(odom.time);
        if !self.config.with_odom || !self.initialized {
            return Ok(());
        }
        let Some(last) = last else {
            return Ok(());
        };

        let dt = odom.time - last;
        if dt <= 0.0 {
            warn!(
                "rejecting odometry at t={:.3}: non-positive interval {dt:.4} s",
                odom.time
            );
            self.dropped_records += 1;
            return Ok(());
        }

        let speed = 0.5 * (odom.left_pulse + odom.right_pulse) * self.config.wheel_circumference()
            / self.config.pulses_per_rev
            / dt;
        if speed.abs() > self.config.odom_speed_cap {
            warn!(
                "ignoring odometry speed {speed:.2} m/s above cap {:.2} m/s",
                self.config.odom_speed_cap
            );
            self.dropped_records += 1;
            return Ok(());
        }

        debug!("wheel speed update {speed:.3} m/s at t={:.3}", odom.time);
        if let Err(e) = self
            .eskf
            .observe_wheel_speed(speed, self.config.sigma_odom_v)
        {
            self.numerical_failure(e)?;
        }
        self.check_health()?;
        self.sink.update_nav_state(self.eskf.nominal_state());
        Ok(())
    }

    fn track_static_motion(&mut self, imu: &ImuSample) {
        self.motion_window.push_back(*imu);
        while self.motion_window.len() > self.config.static_window {
            self.motion_window.pop_front();
        }
        if self.motion_window.len() < self.config.static_window {
            self.zupt_pending = false;
            return;
        }
        let (acc_mean, _) = mean_and_variance(self.motion_window.iter().map(|s| s.accel));
        self.zupt_pending = self.motion_window.iter().all(|s| {
            s.gyro.norm() < self.config.static_gyro_thresh
                && (s.accel - acc_mean).norm() < self.config.static_acc_thresh
        });
    }

    /// Recoverable numerical failure: re-condition once, declare divergence
    /// when it repeats.
    fn numerical_failure(&mut self, e: FilterError) -> Result<(), FilterError> {
        warn!("numerical failure in update: {e}");
        self.nan_strikes += 1;
        if self.nan_strikes >= 2 {
            self.diverged = true;
            return Err(FilterError::Diverged);
        }
        self.eskf.condition_covariance();
        Ok(())
    }

    fn check_health(&mut self) -> Result<(), FilterError> {
        let trace = self.eskf.covariance().trace();
        if self.eskf.is_healthy() && trace < self.config.divergence_cov_trace {
            return Ok(());
        }
        if !self.eskf.nominal_state().is_finite() || trace >= self.config.divergence_cov_trace {
            self.diverged = true;
            return Err(FilterError::Diverged);
        }
        self.nan_strikes += 1;
        if self.nan_strikes >= 2 {
            self.diverged = true;
            return Err(FilterError::Diverged);
        }
        warn!("re-conditioning covariance after numerical failure");
        self.eskf.condition_covariance();
        Ok(())
    }
}
