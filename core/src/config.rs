//! Filter configuration.
//!
//! All tunables recognized by the fusion pipeline, with units in the field
//! docs. A config can be loaded from TOML, JSON, or YAML (chosen by file
//! extension) and is validated before the driver starts; an invalid config
//! never produces a partial run.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::eskf::{EskfTuning, InitialSigmas};
use crate::gnss::{AntennaLayout, GnssStatus};
use crate::FilterError;

/// Complete configuration for a fusion run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Enable wheel-odometry velocity updates.
    pub with_odom: bool,
    /// Enable zero-velocity updates while static.
    pub with_zupt: bool,

    /// Antenna lever arm x in the vehicle frame, meters.
    pub antenna_pos_x: f64,
    /// Antenna lever arm y in the vehicle frame, meters.
    pub antenna_pos_y: f64,
    /// Antenna mounting yaw offset, degrees.
    pub antenna_angle_deg: f64,

    /// Map origin subtracted from UTM positions, meters. `None` latches the
    /// origin from the first valid fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_origin: Option<[f64; 3]>,

    /// Wheel radius, meters.
    pub wheel_radius: f64,
    /// Encoder pulses per wheel revolution.
    pub pulses_per_rev: f64,
    /// Odometry speeds above this magnitude are ignored, m/s.
    pub odom_speed_cap: f64,

    /// Fix quality assigned to GNSS records from the text format, which does
    /// not carry one.
    pub gnss_default_status: GnssStatus,

    /// Gyroscope white noise, rad/s.
    pub sigma_gyro: f64,
    /// Accelerometer white noise, m/s^2.
    pub sigma_acc: f64,
    /// Gyroscope bias random walk, rad/s per sqrt(s).
    pub sigma_bg: f64,
    /// Accelerometer bias random walk, m/s^2 per sqrt(s).
    pub sigma_ba: f64,
    /// GNSS position noise, meters.
    pub sigma_gnss_pos: f64,
    /// GNSS dual-antenna heading noise, degrees.
    pub sigma_gnss_heading_deg: f64,
    /// Wheel-odometry speed noise, m/s.
    pub sigma_odom_v: f64,
    /// Zero-velocity pseudo-measurement noise, m/s.
    pub sigma_zupt: f64,

    /// Initial position sigma, meters.
    pub init_sigma_pos: f64,
    /// Initial velocity sigma, m/s.
    pub init_sigma_vel: f64,
    /// Initial attitude sigma, radians.
    pub init_sigma_rot: f64,
    /// Initial gyro bias sigma, rad/s.
    pub init_sigma_bg: f64,
    /// Initial accelerometer bias sigma, m/s^2.
    pub init_sigma_ba: f64,
    /// Initial gravity sigma, m/s^2.
    pub init_sigma_grav: f64,

    /// IMU gaps larger than this are skipped, seconds.
    pub max_imu_dt: f64,
    /// Maximum iterated-update passes.
    pub iekf_max_iter: usize,
    /// Iterated-update convergence threshold.
    pub iekf_eps: f64,

    /// Trust that the vehicle is static during alignment instead of gating on
    /// sample variance.
    pub assume_static_start: bool,
    /// IMU samples accumulated for the initial alignment.
    pub static_init_samples: usize,
    /// Per-axis gyro variance gate during alignment, (rad/s)^2.
    pub static_init_gyro_var: f64,
    /// Per-axis accelerometer variance gate during alignment, (m/s^2)^2.
    pub static_init_acc_var: f64,
    /// Give up on alignment after this long, seconds.
    pub init_horizon_s: f64,
    /// On alignment timeout, proceed with an identity-attitude initialization
    /// instead of aborting.
    pub init_timeout_identity: bool,

    /// IMU samples in the static-detection window.
    pub static_window: usize,
    /// Angular-rate norm threshold for static detection, rad/s.
    pub static_gyro_thresh: f64,
    /// Accelerometer deviation threshold for static detection, m/s^2.
    pub static_acc_thresh: f64,

    /// GNSS readings older than `last_imu_time - tau_back_s` are dropped.
    pub tau_back_s: f64,
    /// Covariance trace above which the filter is declared divergent.
    pub divergence_cov_trace: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            with_odom: false,
            with_zupt: false,
            antenna_pos_x: 0.0,
            antenna_pos_y: 0.0,
            antenna_angle_deg: 0.0,
            map_origin: None,
            wheel_radius: 0.155,
            pulses_per_rev: 1024.0,
            odom_speed_cap: 35.0,
            gnss_default_status: GnssStatus::FixedRtk,
            sigma_gyro: 1e-3,
            sigma_acc: 1e-1,
            sigma_bg: 1e-6,
            sigma_ba: 1e-4,
            sigma_gnss_pos: 0.1,
            sigma_gnss_heading_deg: 1.0,
            sigma_odom_v: 0.5,
            sigma_zupt: 0.1,
            init_sigma_pos: 0.1,
            init_sigma_vel: 0.1,
            init_sigma_rot: 0.02,
            init_sigma_bg: 1e-4,
            init_sigma_ba: 1e-2,
            init_sigma_grav: 1e-2,
            max_imu_dt: 0.1,
            iekf_max_iter: 3,
            iekf_eps: 1e-6,
            assume_static_start: false,
            static_init_samples: 200,
            static_init_gyro_var: 1e-4,
            static_init_acc_var: 1e-2,
            init_horizon_s: 30.0,
            init_timeout_identity: false,
            static_window: 5,
            static_gyro_thresh: 0.02,
            static_acc_thresh: 0.1,
            tau_back_s: 0.05,
            divergence_cov_trace: 1e8,
        }
    }
}

impl FilterConfig {
    /// Loads and validates a configuration, picking the format from the file
    /// extension (.toml/.json/.yaml/.yml).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let mut text = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .map_err(|e| FilterError::Config(format!("cannot read {}: {e}", path.display())))?;

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        let config: FilterConfig = match ext.as_deref() {
            Some("toml") => toml::from_str(&text)
                .map_err(|e| FilterError::Config(format!("bad TOML config: {e}")))?,
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| FilterError::Config(format!("bad JSON config: {e}")))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
                .map_err(|e| FilterError::Config(format!("bad YAML config: {e}")))?,
            _ => {
                return Err(FilterError::Config(format!(
                    "unsupported config extension on {}",
                    path.display()
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration in the format chosen by the file extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FilterError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        let text = match ext.as_deref() {
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| FilterError::Config(format!("cannot encode TOML: {e}")))?,
            Some("json") => serde_json::to_string_pretty(self)
                .map_err(|e| FilterError::Config(format!("cannot encode JSON: {e}")))?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)
                .map_err(|e| FilterError::Config(format!("cannot encode YAML: {e}")))?,
            _ => {
                return Err(FilterError::Config(format!(
                    "unsupported config extension on {}",
                    path.display()
                )));
            }
        };
        File::create(path)
            .and_then(|mut f| f.write_all(text.as_bytes()))
            .map_err(|e| FilterError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Checks every tunable before the driver starts.
    pub fn validate(&self) -> Result<(), FilterError> {
        let positive = [
            ("sigma_gyro", self.sigma_gyro),
            ("sigma_acc", self.sigma_acc),
            ("sigma_bg", self.sigma_bg),
            ("sigma_ba", self.sigma_ba),
            ("sigma_gnss_pos", self.sigma_gnss_pos),
            ("sigma_gnss_heading_deg", self.sigma_gnss_heading_deg),
            ("sigma_odom_v", self.sigma_odom_v),
            ("sigma_zupt", self.sigma_zupt),
            ("init_sigma_pos", self.init_sigma_pos),
            ("init_sigma_vel", self.init_sigma_vel),
            ("init_sigma_rot", self.init_sigma_rot),
            ("init_sigma_bg", self.init_sigma_bg),
            ("init_sigma_ba", self.init_sigma_ba),
            ("init_sigma_grav", self.init_sigma_grav),
            ("max_imu_dt", self.max_imu_dt),
            ("iekf_eps", self.iekf_eps),
            ("init_horizon_s", self.init_horizon_s),
            ("divergence_cov_trace", self.divergence_cov_trace),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(FilterError::Config(format!("{name} must be positive")));
            }
        }
        if self.with_odom && !(self.wheel_radius > 0.0 && self.pulses_per_rev > 0.0) {
            return Err(FilterError::Config(
                "wheel_radius and pulses_per_rev must be positive when with_odom is set"
                    .to_string(),
            ));
        }
        if self.static_init_samples < 2 {
            return Err(FilterError::Config(
                "static_init_samples must be at least 2".to_string(),
            ));
        }
        if self.static_window == 0 {
            return Err(FilterError::Config(
                "static_window must be at least 1".to_string(),
            ));
        }
        if self.tau_back_s < 0.0 {
            return Err(FilterError::Config(
                "tau_back_s must be non-negative".to_string(),
            ));
        }
        if let Some(origin) = &self.map_origin {
            if origin.iter().any(|v| !v.is_finite()) {
                return Err(FilterError::Config(
                    "map_origin must be finite".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Antenna layout slice of the configuration.
    pub fn antenna(&self) -> AntennaLayout {
        AntennaLayout {
            pos_x: self.antenna_pos_x,
            pos_y: self.antenna_pos_y,
            angle_deg: self.antenna_angle_deg,
        }
    }

    /// Engine tuning slice of the configuration.
    pub fn tuning(&self) -> EskfTuning {
        EskfTuning {
            sigma_gyro: self.sigma_gyro,
            sigma_acc: self.sigma_acc,
            sigma_gyro_bias: self.sigma_bg,
            sigma_acc_bias: self.sigma_ba,
            max_imu_dt: self.max_imu_dt,
            iekf_max_iter: self.iekf_max_iter,
            iekf_eps: self.iekf_eps,
        }
    }

    /// Initial covariance sigmas slice of the configuration.
    pub fn initial_sigmas(&self) -> InitialSigmas {
        InitialSigmas {
            position: self.init_sigma_pos,
            velocity: self.init_sigma_vel,
            rotation: self.init_sigma_rot,
            gyro_bias: self.init_sigma_bg,
            accel_bias: self.init_sigma_ba,
            gravity: self.init_sigma_grav,
        }
    }

    /// Wheel circumference in meters.
    pub fn wheel_circumference(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.wheel_radius
    }

    /// GNSS heading noise in radians.
    pub fn sigma_gnss_heading(&self) -> f64 {
        self.sigma_gnss_heading_deg.to_radians()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        FilterConfig::default().validate().unwrap();
    }

    #[test]
    fn negative_sigma_is_rejected() {
        let mut cfg = FilterConfig::default();
        cfg.sigma_gnss_pos = -1.0;
        assert!(matches!(cfg.validate(), Err(FilterError::Config(_))));
    }

    #[test]
    fn odom_requires_wheel_geometry() {
        let mut cfg = FilterConfig::default();
        cfg.with_odom = true;
        cfg.wheel_radius = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let cfg = FilterConfig {
            with_odom: true,
            map_origin: Some([100.0, 200.0, 3.0]),
            ..FilterConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.toml");
        cfg.save(&path).unwrap();
        let loaded = FilterConfig::load(&path).unwrap();
        assert!(loaded.with_odom);
        assert_eq!(loaded.map_origin, Some([100.0, 200.0, 3.0]));
        assert_eq!(loaded.gnss_default_status, GnssStatus::FixedRtk);
    }

    #[test]
    fn yaml_and_json_round_trip() {
        let cfg = FilterConfig::default();
        let dir = tempfile::tempdir().unwrap();
        for name in ["filter.yaml", "filter.json"] {
            let path = dir.path().join(name);
            cfg.save(&path).unwrap();
            let loaded = FilterConfig::load(&path).unwrap();
            assert_eq!(loaded.static_init_samples, cfg.static_init_samples);
        }
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.ini");
        assert!(FilterConfig::default().save(&path).is_err());
        assert!(FilterConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "with_zupt = true\nsigma_gnss_pos = 0.25\n").unwrap();
        let cfg = FilterConfig::load(&path).unwrap();
        assert!(cfg.with_zupt);
        assert_eq!(cfg.sigma_gnss_pos, 0.25);
        assert_eq!(cfg.static_window, 5);
    }
}
