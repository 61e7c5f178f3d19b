//! Synthetic sensor-file generation.
//!
//! Produces sensor text files in the replay format from simple motion
//! profiles, with seeded Gaussian sensor noise so runs are reproducible.
//! Every profile starts with a static lead-in long enough for the filter's
//! initial alignment. GNSS fixes are produced by inverse-projecting the
//! simulated local track around a base geodetic point, so the generated data
//! exercises the same projection machinery the filter uses.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use gins::earth;
use gins::UtmCoordinate;

/// Motion profile of the simulated vehicle after the static lead-in.
#[derive(Clone, Copy, Debug)]
pub enum Profile {
    /// The vehicle never moves.
    Static,
    /// Accelerate east over one second, then cruise at `speed` m/s.
    Line { speed: f64 },
    /// Drive a circle of radius `radius` m at `speed` m/s.
    Circle { speed: f64, radius: f64 },
}

/// Generation parameters.
#[derive(Clone, Debug)]
pub struct SynthOptions {
    pub profile: Profile,
    /// Total duration, seconds.
    pub duration: f64,
    /// Static lead-in for alignment, seconds.
    pub lead_in: f64,
    /// Base latitude, degrees.
    pub latitude: f64,
    /// Base longitude, degrees.
    pub longitude: f64,
    /// Base altitude, meters.
    pub altitude: f64,
    /// IMU rate, Hz.
    pub imu_rate: f64,
    /// GNSS rate, Hz.
    pub gnss_rate: f64,
    /// Wheel-odometry rate, Hz (0 disables the stream).
    pub odom_rate: f64,
    /// Gyro noise sigma, rad/s.
    pub gyro_noise: f64,
    /// Accelerometer noise sigma, m/s^2.
    pub acc_noise: f64,
    /// GNSS position noise sigma, meters.
    pub gnss_noise: f64,
    /// GNSS withheld inside this window, seconds.
    pub outage: Option<(f64, f64)>,
    /// Emit dual-antenna headings with the fixes.
    pub with_heading: bool,
    /// Wheel radius for pulse synthesis, meters.
    pub wheel_radius: f64,
    /// Encoder pulses per revolution.
    pub pulses_per_rev: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SynthOptions {
    fn default() -> Self {
        SynthOptions {
            profile: Profile::Line { speed: 5.0 },
            duration: 60.0,
            lead_in: 3.0,
            latitude: 48.0,
            longitude: 11.0,
            altitude: 500.0,
            imu_rate: 100.0,
            gnss_rate: 10.0,
            odom_rate: 10.0,
            gyro_noise: 1e-4,
            acc_noise: 1e-3,
            gnss_noise: 0.02,
            outage: None,
            with_heading: false,
            wheel_radius: 0.155,
            pulses_per_rev: 1024.0,
            seed: 42,
        }
    }
}

/// Kinematic truth at one instant, in the local frame anchored at the base
/// point.
struct TruthSample {
    position: Vector3<f64>,
    speed: f64,
    yaw: f64,
    yaw_rate: f64,
    /// Acceleration along the body x axis.
    body_accel_x: f64,
}

fn truth_at(options: &SynthOptions, t: f64) -> TruthSample {
    let tau = (t - options.lead_in).max(0.0);
    match options.profile {
        Profile::Static => TruthSample {
            position: Vector3::zeros(),
            speed: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            body_accel_x: 0.0,
        },
        Profile::Line { speed } => {
            // one second of constant acceleration, then cruise
            let (x, v, a) = if tau <= 0.0 {
                (0.0, 0.0, 0.0)
            } else if tau < 1.0 {
                (0.5 * speed * tau * tau, speed * tau, speed)
            } else {
                (0.5 * speed + speed * (tau - 1.0), speed, 0.0)
            };
            TruthSample {
                position: Vector3::new(x, 0.0, 0.0),
                speed: v,
                yaw: 0.0,
                yaw_rate: 0.0,
                body_accel_x: a,
            }
        }
        Profile::Circle { speed, radius } => {
            if tau <= 0.0 {
                return TruthSample {
                    position: Vector3::zeros(),
                    speed: 0.0,
                    yaw: 0.0,
                    yaw_rate: 0.0,
                    body_accel_x: 0.0,
                };
            }
            let omega = speed / radius;
            let yaw = omega * tau;
            TruthSample {
                position: Vector3::new(radius * yaw.sin(), radius * (1.0 - yaw.cos()), 0.0),
                speed,
                yaw,
                yaw_rate: omega,
                body_accel_x: 0.0,
            }
        }
    }
}

/// Writes a sensor text file for the configured scenario.
pub fn generate<P: AsRef<Path>>(options: &SynthOptions, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let base = earth::lat_lon_to_utm(options.latitude, options.longitude)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let gravity = earth::gravity(options.latitude, options.altitude);

    let mut rng = StdRng::seed_from_u64(options.seed);
    let gyro_noise = Normal::new(0.0, options.gyro_noise)?;
    let acc_noise = Normal::new(0.0, options.acc_noise)?;
    let gnss_noise = Normal::new(0.0, options.gnss_noise)?;

    writeln!(out, "# synthetic sensor stream: {:?}", options.profile)?;
    writeln!(
        out,
        "# base {:.6} deg, {:.6} deg, {:.1} m; gravity {:.4} m/s^2",
        options.latitude, options.longitude, options.altitude, gravity
    )?;

    let imu_dt = 1.0 / options.imu_rate;
    let steps = (options.duration / imu_dt).round() as usize;
    let gnss_every = (options.imu_rate / options.gnss_rate).round().max(1.0) as usize;
    let odom_every = if options.odom_rate > 0.0 {
        Some((options.imu_rate / options.odom_rate).round().max(1.0) as usize)
    } else {
        None
    };
    let circumference = 2.0 * std::f64::consts::PI * options.wheel_radius;

    for i in 0..=steps {
        let t = i as f64 * imu_dt;
        let truth = truth_at(options, t);

        // Specific force in the body frame: centripetal acceleration rotated
        // back through the yaw, minus gravity.
        let accel = Vector3::new(
            truth.body_accel_x + acc_noise.sample(&mut rng),
            truth.speed * truth.yaw_rate + acc_noise.sample(&mut rng),
            gravity + acc_noise.sample(&mut rng),
        );
        let gyro = Vector3::new(
            gyro_noise.sample(&mut rng),
            gyro_noise.sample(&mut rng),
            truth.yaw_rate + gyro_noise.sample(&mut rng),
        );
        writeln!(
            out,
            "IMU {t:.3} {:.9} {:.9} {:.9} {:.6} {:.6} {:.6}",
            gyro.x, gyro.y, gyro.z, accel.x, accel.y, accel.z
        )?;

        let in_outage = options
            .outage
            .is_some_and(|(start, end)| (start..end).contains(&t));
        if i % gnss_every == 0 && !in_outage {
            let shifted = UtmCoordinate {
                easting: base.easting + truth.position.x + gnss_noise.sample(&mut rng),
                northing: base.northing + truth.position.y + gnss_noise.sample(&mut rng),
                ..base
            };
            let (lat, lon) = earth::utm_to_lat_lon(&shifted).map_err(|e| anyhow::anyhow!("{e}"))?;
            let alt = options.altitude + truth.position.z + gnss_noise.sample(&mut rng);
            let heading_valid = u8::from(options.with_heading);
            writeln!(
                out,
                "GNSS {t:.3} {lat:.9} {lon:.9} {alt:.4} {:.4} {heading_valid}",
                truth.yaw.to_degrees()
            )?;
        }

        if let Some(every) = odom_every {
            if i % every == 0 && i > 0 {
                let interval = every as f64 * imu_dt;
                let pulses = truth.speed * options.pulses_per_rev * interval / circumference;
                writeln!(out, "ODOM {t:.3} {pulses:.3} {pulses:.3}")?;
            }
        }
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gins::gnss::GnssStatus;
    use gins::messages::{SensorRecord, TextStreamReader};

    #[test]
    fn generated_stream_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.txt");
        let options = SynthOptions {
            duration: 2.0,
            ..SynthOptions::default()
        };
        generate(&options, &path).unwrap();

        let mut reader = TextStreamReader::open(&path, GnssStatus::FixedRtk).unwrap();
        let records: Vec<SensorRecord> = reader.by_ref().collect();
        assert_eq!(reader.dropped(), 0);

        let imu = records
            .iter()
            .filter(|r| matches!(r, SensorRecord::Imu(_)))
            .count();
        let gnss = records
            .iter()
            .filter(|r| matches!(r, SensorRecord::Gnss(_)))
            .count();
        let odom = records
            .iter()
            .filter(|r| matches!(r, SensorRecord::Odom(_)))
            .count();
        assert_eq!(imu, 201);
        assert_eq!(gnss, 21);
        assert_eq!(odom, 20);
    }

    #[test]
    fn outage_suppresses_fixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outage.txt");
        let options = SynthOptions {
            duration: 4.0,
            outage: Some((1.0, 2.0)),
            ..SynthOptions::default()
        };
        generate(&options, &path).unwrap();

        let reader = TextStreamReader::open(&path, GnssStatus::FixedRtk).unwrap();
        for record in reader {
            if let SensorRecord::Gnss(g) = record {
                assert!(!(1.0..2.0).contains(&g.time), "fix at t={}", g.time);
            }
        }
    }

    #[test]
    fn circle_profile_closes_after_a_lap() {
        let options = SynthOptions {
            profile: Profile::Circle {
                speed: 5.0,
                radius: 20.0,
            },
            lead_in: 0.0,
            ..SynthOptions::default()
        };
        let lap = 2.0 * std::f64::consts::PI * 20.0 / 5.0;
        let truth = truth_at(&options, lap);
        assert!(truth.position.xy().norm() < 1e-6);
    }
}
