//! GNSS reading types and the local-frame preparer.
//!
//! Raw readings carry geodetic coordinates and an optional dual-antenna
//! heading. The preparer projects them onto the UTM grid (into the latched
//! zone when one is given), removes the antenna lever arm, and assembles the
//! 6-DoF prior pose consumed by the filter's SE(3) observation.

use log::debug;
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::earth;
use crate::FilterError;

/// Fix quality reported by the receiver.
///
/// Numeric codes follow the convention of common RTK receivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GnssStatus {
    /// No usable signal.
    #[default]
    NoFix,
    /// Single-point solution, roughly 10 m accuracy.
    SinglePoint,
    /// Pseudo-range differential solution, decimeter level.
    PseudoRangeDiff,
    /// Float RTK, centimeter to decimeter level.
    FloatRtk,
    /// Fixed RTK, centimeter level.
    FixedRtk,
    /// Anything the receiver reports outside the known set.
    Other,
}

impl GnssStatus {
    /// Receiver status code for this fix quality.
    pub fn code(&self) -> i32 {
        match self {
            GnssStatus::NoFix => 0,
            GnssStatus::SinglePoint => 1,
            GnssStatus::PseudoRangeDiff => 2,
            GnssStatus::FloatRtk => 5,
            GnssStatus::FixedRtk => 4,
            GnssStatus::Other => -1,
        }
    }

    /// Maps a receiver status code onto the known set.
    pub fn from_code(code: i32) -> GnssStatus {
        match code {
            0 => GnssStatus::NoFix,
            1 => GnssStatus::SinglePoint,
            2 => GnssStatus::PseudoRangeDiff,
            5 => GnssStatus::FloatRtk,
            4 => GnssStatus::FixedRtk,
            _ => GnssStatus::Other,
        }
    }

    /// True when the receiver produced any position solution at all.
    pub fn has_fix(&self) -> bool {
        !matches!(self, GnssStatus::NoFix)
    }
}

/// A projected position on the UTM grid.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UtmCoordinate {
    /// UTM zone number, 1..=60.
    pub zone: i32,
    /// Easting in meters (false easting included).
    pub easting: f64,
    /// Northing in meters (false northing included in the south).
    pub northing: f64,
    /// Height, taken directly from the GNSS altitude.
    pub z: f64,
    /// True in the northern hemisphere.
    pub north: bool,
}

/// A raw GNSS reading as it arrives from the receiver.
#[derive(Clone, Copy, Debug)]
pub struct GnssReading {
    /// UNIX time of the fix, seconds.
    pub time: f64,
    /// Fix quality.
    pub status: GnssStatus,
    /// Latitude (deg), longitude (deg), altitude (m).
    pub lat_lon_alt: Vector3<f64>,
    /// Dual-antenna heading in degrees.
    pub heading_deg: f64,
    /// Whether the heading is trustworthy.
    pub heading_valid: bool,
}

/// Antenna mounting: lever arm in the vehicle frame and yaw offset.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AntennaLayout {
    /// Lever arm x component in the vehicle frame, meters.
    pub pos_x: f64,
    /// Lever arm y component in the vehicle frame, meters.
    pub pos_y: f64,
    /// Mounting yaw offset in degrees.
    pub angle_deg: f64,
}

/// A GNSS reading after projection into the local metric frame.
#[derive(Clone, Copy, Debug)]
pub struct PreparedGnss {
    /// UNIX time of the fix, seconds.
    pub time: f64,
    /// Fix quality of the source reading.
    pub status: GnssStatus,
    /// Projected grid position.
    pub utm: UtmCoordinate,
    /// Set by the preparer once the projection succeeded.
    pub utm_valid: bool,
    /// Vehicle pose prior in the local metric frame.
    pub pose: Isometry3<f64>,
    /// True when the rotation part of `pose` may be used by an update.
    pub heading_usable: bool,
}

/// Projects only the translation of a reading, without lever arm or heading
/// handling. Used to latch the map origin and UTM zone off the first fix.
pub fn prepare_translation_only(reading: &GnssReading) -> Result<UtmCoordinate, FilterError> {
    if !reading.status.has_fix() {
        return Err(FilterError::NoFix);
    }
    let mut utm = earth::lat_lon_to_utm(reading.lat_lon_alt.x, reading.lat_lon_alt.y)?;
    utm.z = reading.lat_lon_alt.z;
    Ok(utm)
}

/// Converts a raw reading into a vehicle pose prior in the local frame.
///
/// The translation is the UTM projection minus `origin`; the rotation is a
/// pure yaw of `heading - antenna_angle` when the heading is valid, identity
/// (and marked unusable) otherwise. The antenna lever arm is removed by
/// back-projecting the antenna position through the yaw rotation.
///
/// Fails with [`FilterError::NoFix`] when the receiver had no solution and
/// with [`FilterError::Projection`] when the projector rejects the position;
/// in both cases the reading must be skipped. Consumers must check
/// `utm_valid` on the result.
pub fn prepare(
    reading: &GnssReading,
    antenna: &AntennaLayout,
    origin: &Vector3<f64>,
    forced_zone: Option<i32>,
) -> Result<PreparedGnss, FilterError> {
    if !reading.status.has_fix() {
        return Err(FilterError::NoFix);
    }

    let (lat, lon, alt) = (
        reading.lat_lon_alt.x,
        reading.lat_lon_alt.y,
        reading.lat_lon_alt.z,
    );
    let mut utm = match forced_zone {
        Some(zone) => earth::lat_lon_to_utm_in_zone(lat, lon, zone)?,
        None => earth::lat_lon_to_utm(lat, lon)?,
    };
    utm.z = alt;

    let heading_usable = reading.heading_valid;
    let yaw = (reading.heading_deg - antenna.angle_deg).to_radians();
    let rotation = if heading_usable {
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw)
    } else {
        UnitQuaternion::identity()
    };

    let antenna_position = Vector3::new(
        utm.easting - origin.x,
        utm.northing - origin.y,
        alt - origin.z,
    );
    let lever = Vector3::new(antenna.pos_x, antenna.pos_y, 0.0);
    let vehicle_position = antenna_position - rotation * lever;

    debug!(
        "gnss t={:.3} zone={} antenna=({:.3}, {:.3}, {:.3}) heading_usable={}",
        reading.time, utm.zone, antenna_position.x, antenna_position.y, antenna_position.z,
        heading_usable
    );

    Ok(PreparedGnss {
        time: reading.time,
        status: reading.status,
        utm,
        utm_valid: true,
        pose: Isometry3::from_parts(Translation3::from(vehicle_position), rotation),
        heading_usable,
    })
}
