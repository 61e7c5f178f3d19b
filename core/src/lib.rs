//! Loosely-coupled GNSS/INS navigation filter.
//!
//! This crate fuses a 100 Hz inertial stream with sparse GNSS fixes and
//! optional wheel odometry into a continuous 6-DoF pose and velocity estimate
//! at the IMU rate, correcting the IMU biases online and riding out short
//! GNSS outages. The filter is an error-state Kalman filter: the nominal
//! state lives on the SO(3) × R^15 manifold while the uncertainty is tracked
//! over an 18-dimensional tangent-space error vector.
//!
//! The crate is built on [`nalgebra`](https://crates.io/crates/nalgebra) for
//! all linear algebra (fixed-size matrices on the filter path, no steady-state
//! allocation), [`log`](https://crates.io/crates/log) for diagnostics, and
//! [`serde`](https://crates.io/crates/serde) for the configuration surface.
//!
//! ## Crate overview
//!
//! - [`so3`]: SO(3) maps used by the manifold state and the Jacobians.
//! - [`earth`]: WGS-84 constants, gravity, and the UTM projection.
//! - [`state`]: the nominal navigation state and error injection.
//! - [`gnss`]: GNSS reading types and the local-metric-frame preparer.
//! - [`eskf`]: the 18-state predict/update engine.
//! - [`fusion`]: initial alignment and the time-driven dispatch loop.
//! - [`messages`]: the line-oriented sensor text format and pose output.
//! - [`config`]: run configuration, loadable from TOML/JSON/YAML.
//! - [`sink`]: latest-value snapshot slots shared with a viewer thread.
//!
//! ## Error-state layout
//!
//! All covariance and Jacobian code indexes the error vector in one fixed
//! order:
//!
//! ```text
//! δx = [δp (0..3) | δv (3..6) | δθ (6..9) | δb_g (9..12) | δb_a (12..15) | δg (15..18)]
//! ```
//!
//! with the right-perturbation convention `R ← R · Exp(δθ)`.

pub mod config;
pub mod earth;
pub mod eskf;
pub mod fusion;
pub mod gnss;
pub mod messages;
pub mod sink;
pub mod so3;
pub mod state;

use std::fmt::{self, Display};

use nalgebra::{SMatrix, SVector, Vector3};

/// Error-state dimension.
pub const ERROR_DIM: usize = 18;
/// Offset of the position error block.
pub const POS: usize = 0;
/// Offset of the velocity error block.
pub const VEL: usize = 3;
/// Offset of the rotation (tangent) error block.
pub const ROT: usize = 6;
/// Offset of the gyro-bias error block.
pub const BG: usize = 9;
/// Offset of the accelerometer-bias error block.
pub const BA: usize = 12;
/// Offset of the gravity error block.
pub const GRAV: usize = 15;

/// An 18-dimensional error-state vector.
pub type Vector18 = SVector<f64, ERROR_DIM>;
/// An 18×18 covariance or transition matrix.
pub type Matrix18 = SMatrix<f64, ERROR_DIM, ERROR_DIM>;

/// One inertial sample in the body frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImuSample {
    /// Timestamp, seconds, non-decreasing across a run.
    pub time: f64,
    /// Angular rate, rad/s.
    pub gyro: Vector3<f64>,
    /// Specific force, m/s^2.
    pub accel: Vector3<f64>,
}

/// One wheel-encoder sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct OdomSample {
    /// Timestamp, seconds.
    pub time: f64,
    /// Left wheel pulse count over the sample interval.
    pub left_pulse: f64,
    /// Right wheel pulse count over the sample interval.
    pub right_pulse: f64,
}

/// Everything that can go wrong across the pipeline, grouped by kind.
///
/// Only [`FilterError::Diverged`] and [`FilterError::Config`] abort a run;
/// the driver logs and counts the rest.
#[derive(Debug)]
pub enum FilterError {
    /// Geodetic projection rejected the input.
    Projection(String),
    /// The receiver had no position solution.
    NoFix,
    /// NaN, non-invertible innovation, or similar numerical trouble.
    Numerical(String),
    /// Initial alignment could not complete.
    Initialization(String),
    /// Invalid configuration, reported before the driver starts.
    Config(String),
    /// File system or stream failure.
    Io(String),
    /// The filter state is beyond recovery.
    Diverged,
}

impl Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Projection(msg) => write!(f, "projection error: {msg}"),
            FilterError::NoFix => write!(f, "GNSS reading has no fix"),
            FilterError::Numerical(msg) => write!(f, "numerical error: {msg}"),
            FilterError::Initialization(msg) => write!(f, "initialization error: {msg}"),
            FilterError::Config(msg) => write!(f, "configuration error: {msg}"),
            FilterError::Io(msg) => write!(f, "I/O error: {msg}"),
            FilterError::Diverged => write!(f, "filter diverged"),
        }
    }
}

impl std::error::Error for FilterError {}

pub use config::FilterConfig;
pub use eskf::{Eskf, EskfTuning, InitialSigmas};
pub use fusion::Fusion;
pub use gnss::{AntennaLayout, GnssReading, GnssStatus, PreparedGnss, UtmCoordinate};
pub use messages::{PoseWriter, SensorRecord, TextStreamReader};
pub use sink::SharedSink;
pub use state::NavState;
