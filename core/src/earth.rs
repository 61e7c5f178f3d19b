//! Earth model: WGS-84 constants, gravity, and the UTM projection.
//!
//! The projector implements the transverse Mercator series expansion against
//! the WGS-84 ellipsoid (USGS Bulletin 1395 form), good to well under a
//! centimetre inside a zone away from the poles. Both the forward and the
//! inverse mappings are provided, plus a zone-forced forward variant so that
//! a run can keep projecting into the zone latched from its first GNSS fix
//! even if the vehicle crosses a zone boundary.

use crate::FilterError;
use crate::gnss::UtmCoordinate;

// WGS-84 ellipsoid
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
pub const POLAR_RADIUS: f64 = 6356752.31425; // meters
pub const ECCENTRICITY: f64 = 0.0818191908425;
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
pub const GE: f64 = 9.7803253359; // m/s^2 at the equator
pub const GP: f64 = 9.8321849378; // m/s^2 at the poles
pub const SOMIGLIANA_K: f64 =
    (POLAR_RADIUS * GP - EQUATORIAL_RADIUS * GE) / (EQUATORIAL_RADIUS * GE);

/// Nominal gravity magnitude used before alignment has measured it.
pub const STANDARD_GRAVITY: f64 = 9.81; // m/s^2

/// UTM scale factor on the central meridian.
const K0: f64 = 0.9996;
/// False easting applied in every zone.
const FALSE_EASTING: f64 = 500_000.0;
/// False northing applied in the southern hemisphere.
const FALSE_NORTHING: f64 = 10_000_000.0;

/// WGS-84 gravity scalar from the Somigliana model with free-air correction.
///
/// # Arguments
/// * `latitude_deg` - Geodetic latitude in degrees.
/// * `altitude` - Altitude above the ellipsoid in meters.
pub fn gravity(latitude_deg: f64, altitude: f64) -> f64 {
    let sin_lat = latitude_deg.to_radians().sin();
    let g0 = (GE * (1.0 + SOMIGLIANA_K * sin_lat * sin_lat))
        / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
    g0 - 3.08e-6 * altitude
}

/// UTM zone for a geodetic position, including the Norway and Svalbard
/// exceptions.
pub fn utm_zone(latitude_deg: f64, longitude_deg: f64) -> i32 {
    let mut zone = ((longitude_deg + 180.0) / 6.0).floor() as i32 + 1;
    if (56.0..64.0).contains(&latitude_deg) && (3.0..12.0).contains(&longitude_deg) {
        zone = 32;
    }
    if (72.0..84.0).contains(&latitude_deg) {
        zone = match longitude_deg {
            l if (0.0..9.0).contains(&l) => 31,
            l if (9.0..21.0).contains(&l) => 33,
            l if (21.0..33.0).contains(&l) => 35,
            l if (33.0..42.0).contains(&l) => 37,
            _ => zone,
        };
    }
    zone
}

fn check_geodetic(latitude_deg: f64, longitude_deg: f64) -> Result<(), FilterError> {
    if !latitude_deg.is_finite() || !longitude_deg.is_finite() {
        return Err(FilterError::Projection(format!(
            "non-finite geodetic position ({latitude_deg}, {longitude_deg})"
        )));
    }
    if latitude_deg.abs() >= 84.0 {
        return Err(FilterError::Projection(format!(
            "latitude {latitude_deg} deg outside the UTM domain"
        )));
    }
    Ok(())
}

/// Projects a geodetic position onto the UTM grid, choosing the zone from the
/// longitude.
///
/// Fails when `|lat| >= 84` degrees or either coordinate is non-finite.
pub fn lat_lon_to_utm(latitude_deg: f64, longitude_deg: f64) -> Result<UtmCoordinate, FilterError> {
    check_geodetic(latitude_deg, longitude_deg)?;
    let zone = utm_zone(latitude_deg, longitude_deg);
    lat_lon_to_utm_in_zone(latitude_deg, longitude_deg, zone)
}

/// Projects a geodetic position into a specific UTM zone.
///
/// Used after the zone has been latched from the first fix so that the local
/// metric frame stays continuous across zone boundaries.
pub fn lat_lon_to_utm_in_zone(
    latitude_deg: f64,
    longitude_deg: f64,
    zone: i32,
) -> Result<UtmCoordinate, FilterError> {
    check_geodetic(latitude_deg, longitude_deg)?;

    let lat = latitude_deg.to_radians();
    let central_meridian_deg = (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0;
    let dlon = (longitude_deg - central_meridian_deg).to_radians();

    let e2 = ECCENTRICITY_SQUARED;
    let ep2 = e2 / (1.0 - e2);
    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let nu = EQUATORIAL_RADIUS / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = ep2 * cos_lat * cos_lat;
    let a = cos_lat * dlon;
    let m = meridian_arc(lat);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let easting = K0
        * nu
        * (a + (1.0 - t + c) * a3 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
        + FALSE_EASTING;
    let mut northing = K0
        * (m + nu
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));

    let north = latitude_deg >= 0.0;
    if !north {
        northing += FALSE_NORTHING;
    }

    Ok(UtmCoordinate {
        zone,
        easting,
        northing,
        z: 0.0,
        north,
    })
}

/// Inverse projection from UTM grid coordinates back to geodetic degrees.
pub fn utm_to_lat_lon(utm: &UtmCoordinate) -> Result<(f64, f64), FilterError> {
    if !utm.easting.is_finite() || !utm.northing.is_finite() {
        return Err(FilterError::Projection(
            "non-finite UTM coordinate".to_string(),
        ));
    }
    if utm.zone < 1 || utm.zone > 60 {
        return Err(FilterError::Projection(format!(
            "UTM zone {} out of range",
            utm.zone
        )));
    }

    let e2 = ECCENTRICITY_SQUARED;
    let ep2 = e2 / (1.0 - e2);
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let x = utm.easting - FALSE_EASTING;
    let y = if utm.north {
        utm.northing
    } else {
        utm.northing - FALSE_NORTHING
    };
    let central_meridian_deg = (utm.zone as f64 - 1.0) * 6.0 - 180.0 + 3.0;

    let m = y / K0;
    let mu = m
        / (EQUATORIAL_RADIUS * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0));

    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_3 * e1;
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let n1 = EQUATORIAL_RADIUS / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let t1 = tan_phi1 * tan_phi1;
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = EQUATORIAL_RADIUS * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let lat = phi1
        - (n1 * tan_phi1 / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d6
                    / 720.0);
    let lon = (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d5 / 120.0)
        / cos_phi1;

    Ok((lat.to_degrees(), central_meridian_deg + lon.to_degrees()))
}

/// Meridian arc length from the equator to the given latitude (radians).
fn meridian_arc(lat: f64) -> f64 {
    let e2 = ECCENTRICITY_SQUARED;
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    EQUATORIAL_RADIUS
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn gravity_at_reference_latitudes() {
        assert_approx_eq!(gravity(0.0, 0.0), GE, 1e-6);
        assert_approx_eq!(gravity(90.0, 0.0), GP, 1e-6);
        // free-air correction lowers gravity with altitude
        assert!(gravity(45.0, 1000.0) < gravity(45.0, 0.0));
    }

    #[test]
    fn zone_selection() {
        assert_eq!(utm_zone(48.0, 11.0), 32);
        assert_eq!(utm_zone(0.0, 0.0), 31);
        assert_eq!(utm_zone(0.0, -180.0), 1);
        assert_eq!(utm_zone(0.0, 179.9), 60);
    }

    #[test]
    fn norway_and_svalbard_exceptions() {
        assert_eq!(utm_zone(60.0, 5.0), 32);
        assert_eq!(utm_zone(78.0, 15.0), 33);
        assert_eq!(utm_zone(78.0, 25.0), 35);
    }

    #[test]
    fn central_meridian_maps_to_false_easting() {
        let utm = lat_lon_to_utm(40.0, 3.0).unwrap();
        assert_eq!(utm.zone, 31);
        assert_approx_eq!(utm.easting, FALSE_EASTING, 1e-3);
        assert!(utm.north);
    }

    #[test]
    fn southern_hemisphere_offset() {
        let utm = lat_lon_to_utm(-33.9, 18.4).unwrap();
        assert!(!utm.north);
        assert!(utm.northing > 6_000_000.0);
    }

    #[test]
    fn rejects_polar_latitudes_and_bad_input() {
        assert!(lat_lon_to_utm(84.0, 10.0).is_err());
        assert!(lat_lon_to_utm(-85.0, 10.0).is_err());
        assert!(lat_lon_to_utm(45.0, f64::NAN).is_err());
    }

    #[test]
    fn round_trip_grid() {
        // Round trip stays within 1e-7 degrees for |lat| < 80.
        let mut lat = -79.5;
        while lat < 80.0 {
            let mut lon = -177.0;
            while lon < 180.0 {
                let utm = lat_lon_to_utm(lat, lon).unwrap();
                let (lat2, lon2) = utm_to_lat_lon(&utm).unwrap();
                assert_approx_eq!(lat, lat2, 1e-7);
                assert_approx_eq!(lon, lon2, 1e-7);
                lon += 13.0;
            }
            lat += 9.5;
        }
    }

    #[test]
    fn forced_zone_keeps_frame_continuous() {
        // Two fixes either side of the zone 31/32 boundary, projected into the
        // same zone, must come out a small metric step apart.
        let a = lat_lon_to_utm_in_zone(48.0, 5.999, 31).unwrap();
        let b = lat_lon_to_utm_in_zone(48.0, 6.001, 31).unwrap();
        let de = b.easting - a.easting;
        let dn = b.northing - a.northing;
        assert!((de * de + dn * dn).sqrt() < 200.0);
    }
}
