//! Nominal navigation state on the SO(3) × R^15 manifold.

use std::fmt::{self, Display};

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::earth::STANDARD_GRAVITY;
use crate::so3;
use crate::{BA, BG, GRAV, POS, ROT, VEL, Vector18};

/// Best current estimate of the vehicle pose, velocity, IMU biases, and the
/// gravity vector expressed in the local metric (navigation) frame.
///
/// The rotation is stored as a unit quaternion so that repeated composition
/// can neither hit a parameterization singularity nor drift away from unit
/// norm; the quaternion is renormalized after every injection. The error
/// state used by the filter lives in the tangent space and is folded in
/// through [`NavState::compose_right`] only.
#[derive(Clone, Copy, Debug)]
pub struct NavState {
    /// Timestamp in seconds.
    pub time: f64,
    /// Body-to-navigation rotation.
    pub rotation: UnitQuaternion<f64>,
    /// Position in the local metric frame, meters.
    pub position: Vector3<f64>,
    /// Velocity in the navigation frame, m/s.
    pub velocity: Vector3<f64>,
    /// Gyroscope bias, rad/s.
    pub gyro_bias: Vector3<f64>,
    /// Accelerometer bias, m/s^2.
    pub accel_bias: Vector3<f64>,
    /// Gravity vector in the navigation frame, m/s^2.
    pub gravity: Vector3<f64>,
}

impl Default for NavState {
    fn default() -> Self {
        NavState {
            time: 0.0,
            rotation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            gravity: Vector3::new(0.0, 0.0, -STANDARD_GRAVITY),
        }
    }
}

impl NavState {
    /// The pose part of the state as a rigid-body transform.
    pub fn se3(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }

    /// Folds an 18-dimensional error vector into the nominal state.
    ///
    /// Position, velocity, biases, and gravity are additive; the rotation
    /// error is applied by right multiplication `R ← R · Exp(δθ)`, matching
    /// the perturbation convention of every Jacobian in the filter.
    pub fn compose_right(&mut self, dx: &Vector18) {
        self.position += dx.fixed_rows::<3>(POS).into_owned();
        self.velocity += dx.fixed_rows::<3>(VEL).into_owned();
        let dtheta = dx.fixed_rows::<3>(ROT).into_owned();
        self.rotation *= so3::exp(&dtheta);
        self.rotation.renormalize();
        self.gyro_bias += dx.fixed_rows::<3>(BG).into_owned();
        self.accel_bias += dx.fixed_rows::<3>(BA).into_owned();
        self.gravity += dx.fixed_rows::<3>(GRAV).into_owned();
    }

    /// True when every component of the state is finite.
    pub fn is_finite(&self) -> bool {
        self.rotation.coords.iter().all(|v| v.is_finite())
            && self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.gyro_bias.iter().all(|v| v.is_finite())
            && self.accel_bias.iter().all(|v| v.is_finite())
            && self.gravity.iter().all(|v| v.is_finite())
    }
}

impl Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.rotation.quaternion();
        write!(
            f,
            "t: {:.3}, p: [{:.3}, {:.3}, {:.3}], v: [{:.3}, {:.3}, {:.3}], q: [{:.4}, {:.4}, {:.4}, {:.4}], bg: [{:.2e}, {:.2e}, {:.2e}], ba: [{:.2e}, {:.2e}, {:.2e}]",
            self.time,
            self.position.x, self.position.y, self.position.z,
            self.velocity.x, self.velocity.y, self.velocity.z,
            q.i, q.j, q.k, q.w,
            self.gyro_bias.x, self.gyro_bias.y, self.gyro_bias.z,
            self.accel_bias.x, self.accel_bias.y, self.accel_bias.z,
        )
    }
}
