//! Sensor stream ingest and pose output.
//!
//! The input format is line-oriented text, one record per line, with `#`
//! comments and blank lines skipped:
//!
//! ```text
//! IMU <t> <gx> <gy> <gz> <ax> <ay> <az>
//! ODOM <t> <wl> <wr>
//! GNSS <t> <lat> <lon> <alt> <heading_deg> <heading_valid_0_or_1>
//! ```
//!
//! Malformed records are dropped with a warning and counted; they never stop
//! the run. The output is one TUM-style pose per line:
//! `<t> <tx> <ty> <tz> <qx> <qy> <qz> <qw>`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;

use log::warn;
use nalgebra::{Isometry3, Vector3};

use crate::gnss::{GnssReading, GnssStatus};
use crate::{FilterError, ImuSample, OdomSample};

/// One record from the sensor stream, in arrival order.
#[derive(Clone, Copy, Debug)]
pub enum SensorRecord {
    Imu(ImuSample),
    Odom(OdomSample),
    Gnss(GnssReading),
}

impl SensorRecord {
    /// Timestamp carried by the record.
    pub fn time(&self) -> f64 {
        match self {
            SensorRecord::Imu(s) => s.time,
            SensorRecord::Odom(s) => s.time,
            SensorRecord::Gnss(s) => s.time,
        }
    }
}

/// Parses a single non-comment line of the sensor text format.
///
/// The text format carries no GNSS status, so the caller supplies the fix
/// quality to assign.
pub fn parse_record(line: &str, gnss_status: GnssStatus) -> Option<SensorRecord> {
    let mut fields = line.split_whitespace();
    let tag = fields.next()?;
    let values: Vec<f64> = fields.map(str::parse).collect::<Result<_, _>>().ok()?;
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    match (tag, values.len()) {
        ("IMU", 7) => Some(SensorRecord::Imu(ImuSample {
            time: values[0],
            gyro: Vector3::new(values[1], values[2], values[3]),
            accel: Vector3::new(values[4], values[5], values[6]),
        })),
        ("ODOM", 3) => Some(SensorRecord::Odom(OdomSample {
            time: values[0],
            left_pulse: values[1],
            right_pulse: values[2],
        })),
        ("GNSS", 6) => Some(SensorRecord::Gnss(GnssReading {
            time: values[0],
            status: gnss_status,
            lat_lon_alt: Vector3::new(values[1], values[2], values[3]),
            heading_deg: values[4],
            heading_valid: values[5] != 0.0,
        })),
        _ => None,
    }
}

/// Streaming reader over a sensor text file.
pub struct TextStreamReader {
    lines: Lines<BufReader<File>>,
    gnss_status: GnssStatus,
    dropped: usize,
}

impl TextStreamReader {
    /// Opens a sensor file, assigning `gnss_status` to every GNSS record.
    pub fn open<P: AsRef<Path>>(path: P, gnss_status: GnssStatus) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| FilterError::Io(format!("cannot open {}: {e}", path.display())))?;
        Ok(TextStreamReader {
            lines: BufReader::new(file).lines(),
            gnss_status,
            dropped: 0,
        })
    }

    /// Number of malformed or unreadable records dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Iterator for TextStreamReader {
    type Item = SensorRecord;

    fn next(&mut self) -> Option<SensorRecord> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!("unreadable line in sensor stream: {e}");
                    self.dropped += 1;
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_record(trimmed, self.gnss_status) {
                Some(record) => return Some(record),
                None => {
                    warn!("dropping malformed record: {trimmed}");
                    self.dropped += 1;
                }
            }
        }
    }
}

/// Writes estimated poses in TUM format to a text file.
pub struct PoseWriter {
    out: BufWriter<File>,
}

impl PoseWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| FilterError::Io(format!("cannot create {}: {e}", path.display())))?;
        Ok(PoseWriter {
            out: BufWriter::new(file),
        })
    }

    pub fn write_pose(&mut self, time: f64, pose: &Isometry3<f64>) -> Result<(), FilterError> {
        let t = pose.translation.vector;
        let q = pose.rotation.quaternion();
        writeln!(
            self.out,
            "{:.6} {:.6} {:.6} {:.6} {:.9} {:.9} {:.9} {:.9}",
            time, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )
        .map_err(|e| FilterError::Io(format!("cannot write pose: {e}")))
    }

    pub fn flush(&mut self) -> Result<(), FilterError> {
        self.out
            .flush()
            .map_err(|e| FilterError::Io(format!("cannot flush pose output: {e}")))
    }
}
