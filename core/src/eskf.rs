//! Error-state Kalman filter over the 18-dimensional tangent space.
//!
//! The nominal state lives on SO(3) × R^15 ([`NavState`]); the filter
//! maintains a Gaussian over the error state
//! `δx = [δp, δv, δθ, δb_g, δb_a, δg]` and folds each correction back into
//! the nominal state by right composition. Three observation types are
//! supported: an SE(3)-like pose prior from prepared GNSS, a body-frame
//! wheel speed, and a zero-velocity pseudo-measurement. Updates run through
//! a short iterated relinearization loop and use the Joseph form plus a
//! tangent-space re-anchor to keep the covariance consistent.

use log::warn;
use nalgebra::{Isometry3, Matrix3, SMatrix, SVector, Vector3};

use crate::so3;
use crate::state::NavState;
use crate::{FilterError, ImuSample, Matrix18, Vector18, BA, BG, GRAV, POS, ROT, VEL};

/// Continuous-time noise densities and update controls for the filter.
#[derive(Clone, Copy, Debug)]
pub struct EskfTuning {
    /// Gyroscope white noise, rad/s.
    pub sigma_gyro: f64,
    /// Accelerometer white noise, m/s^2.
    pub sigma_acc: f64,
    /// Gyroscope bias random walk, rad/s per sqrt(s).
    pub sigma_gyro_bias: f64,
    /// Accelerometer bias random walk, m/s^2 per sqrt(s).
    pub sigma_acc_bias: f64,
    /// Predict steps with a larger gap are skipped (sensor dropouts).
    pub max_imu_dt: f64,
    /// Maximum relinearization passes per update.
    pub iekf_max_iter: usize,
    /// Correction norm below which iteration stops.
    pub iekf_eps: f64,
}

impl Default for EskfTuning {
    fn default() -> Self {
        EskfTuning {
            sigma_gyro: 1e-3,
            sigma_acc: 1e-1,
            sigma_gyro_bias: 1e-6,
            sigma_acc_bias: 1e-4,
            max_imu_dt: 0.1,
            iekf_max_iter: 3,
            iekf_eps: 1e-6,
        }
    }
}

/// One-sigma priors for the diagonal of the initial error covariance.
#[derive(Clone, Copy, Debug)]
pub struct InitialSigmas {
    pub position: f64,
    pub velocity: f64,
    pub rotation: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
    pub gravity: f64,
}

impl Default for InitialSigmas {
    fn default() -> Self {
        InitialSigmas {
            position: 0.1,
            velocity: 0.1,
            rotation: 0.02,
            gyro_bias: 1e-4,
            accel_bias: 1e-2,
            gravity: 1e-2,
        }
    }
}

/// The error-state Kalman filter engine.
///
/// Owns the nominal state and the 18×18 error covariance exclusively; all
/// readers receive copies via [`Eskf::nominal_state`]. No allocation happens
/// on the predict/update path, every matrix involved is fixed-size.
#[derive(Clone, Debug)]
pub struct Eskf {
    state: NavState,
    cov: Matrix18,
    tuning: EskfTuning,
    last_time: Option<f64>,
}

impl Eskf {
    pub fn new(tuning: EskfTuning) -> Self {
        Eskf {
            state: NavState::default(),
            cov: Matrix18::identity(),
            tuning,
            last_time: None,
        }
    }

    /// Resets the filter to a known nominal state and diagonal covariance.
    ///
    /// Clears the propagation clock; the next IMU sample only latches its
    /// timestamp.
    pub fn init(&mut self, state: NavState, sigmas: &InitialSigmas) {
        self.state = state;
        self.cov = Matrix18::zeros();
        self.cov
            .fixed_view_mut::<3, 3>(POS, POS)
            .fill_diagonal(sigmas.position * sigmas.position);
        self.cov
            .fixed_view_mut::<3, 3>(VEL, VEL)
            .fill_diagonal(sigmas.velocity * sigmas.velocity);
        self.cov
            .fixed_view_mut::<3, 3>(ROT, ROT)
            .fill_diagonal(sigmas.rotation * sigmas.rotation);
        self.cov
            .fixed_view_mut::<3, 3>(BG, BG)
            .fill_diagonal(sigmas.gyro_bias * sigmas.gyro_bias);
        self.cov
            .fixed_view_mut::<3, 3>(BA, BA)
            .fill_diagonal(sigmas.accel_bias * sigmas.accel_bias);
        self.cov
            .fixed_view_mut::<3, 3>(GRAV, GRAV)
            .fill_diagonal(sigmas.gravity * sigmas.gravity);
        self.last_time = None;
    }

    /// Immutable snapshot of the nominal state.
    pub fn nominal_state(&self) -> NavState {
        self.state
    }

    /// Current error covariance.
    pub fn covariance(&self) -> &Matrix18 {
        &self.cov
    }

    /// Timestamp of the last integrated IMU sample.
    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// Integrates one IMU sample: nominal-state mechanization plus covariance
    /// propagation through the linearized error dynamics.
    pub fn predict(&mut self, imu: &ImuSample) {
        let t = imu.time;
        let last = match self.last_time {
            None => {
                self.last_time = Some(t);
                self.state.time = t;
                return;
            }
            Some(last) => last,
        };

        let dt = t - last;
        if dt <= 0.0 || dt > self.tuning.max_imu_dt {
            warn!("skipping IMU sample at t={t:.4}: dt={dt:.4} s out of range");
            self.last_time = Some(t);
            self.state.time = t;
            return;
        }

        let omega = imu.gyro - self.state.gyro_bias;
        let accel = imu.accel - self.state.accel_bias;
        let r_mat = self.state.rotation.to_rotation_matrix().into_inner();
        let acc_nav = r_mat * accel + self.state.gravity;

        // Nominal integration, right form.
        self.state.position += self.state.velocity * dt + 0.5 * acc_nav * dt * dt;
        self.state.velocity += acc_nav * dt;
        self.state.rotation *= so3::exp(&(omega * dt));
        self.state.rotation.renormalize();
        self.state.time = t;

        // Error-state transition.
        let mut f = Matrix18::identity();
        f.fixed_view_mut::<3, 3>(POS, VEL).fill_diagonal(dt);
        f.fixed_view_mut::<3, 3>(VEL, ROT)
            .copy_from(&(-(r_mat * so3::hat(&accel)) * dt));
        f.fixed_view_mut::<3, 3>(VEL, BA).copy_from(&(-r_mat * dt));
        f.fixed_view_mut::<3, 3>(VEL, GRAV).fill_diagonal(dt);
        f.fixed_view_mut::<3, 3>(ROT, ROT)
            .copy_from(&so3::exp_matrix(&(-omega * dt)));
        f.fixed_view_mut::<3, 3>(ROT, BG).fill_diagonal(-dt);

        let mut q = Matrix18::zeros();
        let sigma_acc_block =
            Matrix3::from_diagonal_element(self.tuning.sigma_acc * self.tuning.sigma_acc);
        q.fixed_view_mut::<3, 3>(VEL, VEL)
            .copy_from(&(r_mat * sigma_acc_block * r_mat.transpose() * dt * dt));
        q.fixed_view_mut::<3, 3>(ROT, ROT)
            .fill_diagonal(self.tuning.sigma_gyro * self.tuning.sigma_gyro * dt * dt);
        q.fixed_view_mut::<3, 3>(BG, BG)
            .fill_diagonal(self.tuning.sigma_gyro_bias * self.tuning.sigma_gyro_bias * dt);
        q.fixed_view_mut::<3, 3>(BA, BA)
            .fill_diagonal(self.tuning.sigma_acc_bias * self.tuning.sigma_acc_bias * dt);

        self.cov = f * self.cov * f.transpose() + q;
        self.last_time = Some(t);
    }

    /// SE(3)-like GNSS observation.
    ///
    /// Uses the full 6-dimensional model when `with_rotation` is set (valid
    /// dual-antenna heading) and a 3-dimensional position-only model
    /// otherwise.
    pub fn observe_pose(
        &mut self,
        pose: &Isometry3<f64>,
        sigma_pos: f64,
        sigma_rot: f64,
        with_rotation: bool,
    ) -> Result<(), FilterError> {
        let p_obs = pose.translation.vector;
        let r_obs = pose.rotation;

        if with_rotation {
            let mut noise = SMatrix::<f64, 6, 6>::zeros();
            noise
                .fixed_view_mut::<3, 3>(0, 0)
                .fill_diagonal(sigma_pos * sigma_pos);
            noise
                .fixed_view_mut::<3, 3>(3, 3)
                .fill_diagonal(sigma_rot * sigma_rot);
            self.iterated_update(noise, |state: &NavState| {
                let mut residual = SVector::<f64, 6>::zeros();
                residual
                    .fixed_rows_mut::<3>(0)
                    .copy_from(&(p_obs - state.position));
                residual
                    .fixed_rows_mut::<3>(3)
                    .copy_from(&so3::log(&(state.rotation.inverse() * r_obs)));
                let mut h = SMatrix::<f64, 6, 18>::zeros();
                h.fixed_view_mut::<3, 3>(0, POS).fill_diagonal(1.0);
                h.fixed_view_mut::<3, 3>(3, ROT).fill_diagonal(1.0);
                (residual, h)
            })
        } else {
            let noise = SMatrix::<f64, 3, 3>::from_diagonal_element(sigma_pos * sigma_pos);
            self.iterated_update(noise, |state: &NavState| {
                let residual: SVector<f64, 3> = p_obs - state.position;
                let mut h = SMatrix::<f64, 3, 18>::zeros();
                h.fixed_view_mut::<3, 3>(0, POS).fill_diagonal(1.0);
                (residual, h)
            })
        }
    }

    /// Body-frame longitudinal speed observation from the wheel odometer.
    ///
    /// The innovation is formed in the navigation frame,
    /// `r = R · (s, 0, 0) − v`, with the matching Jacobian `∂/∂δv = I`,
    /// `∂/∂δθ = R [s]×` so that a zero residual yields a zero correction.
    pub fn observe_wheel_speed(&mut self, speed: f64, sigma: f64) -> Result<(), FilterError> {
        let noise = SMatrix::<f64, 3, 3>::from_diagonal_element(sigma * sigma);
        self.iterated_update(noise, move |state: &NavState| {
            let body = Vector3::new(speed, 0.0, 0.0);
            let r_mat = state.rotation.to_rotation_matrix().into_inner();
            let residual: SVector<f64, 3> = r_mat * body - state.velocity;
            let mut h = SMatrix::<f64, 3, 18>::zeros();
            h.fixed_view_mut::<3, 3>(0, VEL).fill_diagonal(1.0);
            h.fixed_view_mut::<3, 3>(0, ROT)
                .copy_from(&(r_mat * so3::hat(&body)));
            (residual, h)
        })
    }

    /// Zero-velocity pseudo-measurement, fired while the vehicle is static.
    pub fn observe_zero_velocity(&mut self, sigma: f64) -> Result<(), FilterError> {
        let noise = SMatrix::<f64, 3, 3>::from_diagonal_element(sigma * sigma);
        self.iterated_update(noise, |state: &NavState| {
            let residual: SVector<f64, 3> = -state.velocity;
            let mut h = SMatrix::<f64, 3, 18>::zeros();
            h.fixed_view_mut::<3, 3>(0, VEL).fill_diagonal(1.0);
            (residual, h)
        })
    }

    /// Shared iterated-update machinery.
    ///
    /// Relinearizes residual and Jacobian at the injected nominal state until
    /// the correction norm drops below `iekf_eps` or the iteration limit is
    /// reached; convergence failure keeps the last correction. The covariance
    /// is then updated once in Joseph form with the final gain and projected
    /// through `I − ½[δθ]×` to re-anchor the rotation block.
    fn iterated_update<const D: usize, M>(
        &mut self,
        noise: SMatrix<f64, D, D>,
        model: M,
    ) -> Result<(), FilterError>
    where
        M: Fn(&NavState) -> (SVector<f64, D>, SMatrix<f64, D, 18>),
    {
        let mut gain = SMatrix::<f64, 18, D>::zeros();
        let mut jac = SMatrix::<f64, D, 18>::zeros();
        let mut total: Vector18 = Vector18::zeros();

        for _ in 0..self.tuning.iekf_max_iter.max(1) {
            let (residual, h) = model(&self.state);
            let innovation_cov = h * self.cov * h.transpose() + noise;
            let inv = innovation_cov.try_inverse().ok_or_else(|| {
                FilterError::Numerical("singular innovation covariance".to_string())
            })?;
            let k = self.cov * h.transpose() * inv;
            // Gauss-Newton step on the MAP cost: the prior term H * total keeps
            // a linear measurement from being re-applied on every pass.
            let updated: Vector18 = k * (residual + h * total);
            let dx = updated - total;
            if dx.iter().any(|v| !v.is_finite()) {
                return Err(FilterError::Numerical(
                    "non-finite Kalman correction".to_string(),
                ));
            }

            self.state.compose_right(&dx);
            total = updated;
            gain = k;
            jac = h;

            if dx.norm() < self.tuning.iekf_eps {
                break;
            }
        }

        let i_kh = Matrix18::identity() - gain * jac;
        self.cov = i_kh * self.cov * i_kh.transpose() + gain * noise * gain.transpose();

        // Re-anchor the rotation block of the covariance at the new nominal.
        let dtheta: Vector3<f64> = total.fixed_rows::<3>(ROT).into_owned();
        let mut j = Matrix18::identity();
        j.fixed_view_mut::<3, 3>(ROT, ROT)
            .copy_from(&so3::reset_jacobian(&dtheta));
        self.cov = j * self.cov * j.transpose();
        self.cov = 0.5 * (self.cov + self.cov.transpose());
        Ok(())
    }

    /// True while the nominal state and the covariance are free of NaN/Inf.
    pub fn is_healthy(&self) -> bool {
        self.state.is_finite() && self.cov.iter().all(|v| v.is_finite())
    }

    /// Recovery path for numerical failures: symmetrize the covariance, clamp
    /// negative eigenvalues to zero, and scrub non-finite entries.
    pub fn condition_covariance(&mut self) {
        let mut sym = 0.5 * (self.cov + self.cov.transpose());
        for v in sym.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        let eigen = sym.symmetric_eigen();
        let clamped = eigen.eigenvalues.map(|l| l.max(0.0));
        self.cov =
            eigen.eigenvectors * Matrix18::from_diagonal(&clamped) * eigen.eigenvectors.transpose();
    }
}
