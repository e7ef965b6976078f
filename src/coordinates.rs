//! # Sky coordinates
//!
//! FK5 RA/Dec pointings and the few pure astrometric helpers the
//! observatory needs: angular separation and horizontal coordinates.

use chrono::{DateTime, Utc};
use nalgebra as na;
use serde::{Deserialize, Serialize};
use skyangle::Conversion;
use std::fmt;

/// Minimum altitude, in degrees, at which a target is observable
pub const MIN_ALTITUDE: f64 = 30.;

/// Observatory location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Latitude in degrees
    pub lat: f64,
    /// East longitude in degrees
    pub lon: f64,
    /// Height in metres
    pub height: f64,
}

/// Origin of a pointing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordKind {
    Plain,
    Science,
    Sky,
    Standard,
}

/// An RA/Dec pointing in degrees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub ra: f64,
    pub dec: f64,
    /// Position angle in degrees
    pub pa: f64,
    pub kind: CoordKind,
    pub source_id: Option<i64>,
    guide_pixel: Option<(f64, f64)>,
}
impl Coordinates {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra,
            dec,
            pa: 0.,
            kind: CoordKind::Plain,
            source_id: None,
            guide_pixel: None,
        }
    }
    pub fn science(ra: f64, dec: f64, pa: f64) -> Self {
        Self {
            pa,
            kind: CoordKind::Science,
            ..Self::new(ra, dec)
        }
    }
    pub fn sky(ra: f64, dec: f64) -> Self {
        Self {
            kind: CoordKind::Sky,
            ..Self::new(ra, dec)
        }
    }
    pub fn standard(ra: f64, dec: f64, source_id: Option<i64>) -> Self {
        Self {
            kind: CoordKind::Standard,
            source_id,
            ..Self::new(ra, dec)
        }
    }
    /// Guides on `pixel` of the master frame instead of its centre
    pub fn with_guide_pixel(self, pixel: (f64, f64)) -> Self {
        Self {
            guide_pixel: Some(pixel),
            ..self
        }
    }
    /// The master frame pixel to guide on, `None` for the central pixel
    ///
    /// Only science pointings carry an override.
    pub fn guide_pixel(&self) -> Option<(f64, f64)> {
        match self.kind {
            CoordKind::Science => self.guide_pixel,
            _ => None,
        }
    }
    /// Angular separation in degrees
    pub fn separation(&self, other: &Coordinates) -> f64 {
        angular_separation(self.ra, self.dec, other.ra, other.dec)
    }
    /// Altitude and azimuth in degrees at `site` and `time`
    pub fn altaz(&self, site: &Site, time: DateTime<Utc>) -> (f64, f64) {
        radec_to_altaz(self.ra, self.dec, site, time)
    }
    /// Whether the pointing is above [MIN_ALTITUDE]
    pub fn is_observable(&self, site: &Site, time: DateTime<Utc>) -> bool {
        self.altaz(site, time).0 >= MIN_ALTITUDE
    }
}
impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:?} (ra={:.6}, dec={:.6})>", self.kind, self.ra, self.dec)
    }
}

fn unit_vector(lon: f64, lat: f64) -> na::Vector3<f64> {
    let (lon, lat) = (lon.to_radians(), lat.to_radians());
    na::Vector3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
}

/// Angular separation, in degrees, between two spherical positions given in degrees
pub fn angular_separation(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (a, b) = (unit_vector(lon1, lat1), unit_vector(lon2, lat2));
    a.cross(&b).norm().atan2(a.dot(&b)).to_degrees()
}

/// Angular separation in arcsec
pub fn separation_arcsec(a: &Coordinates, b: &Coordinates) -> f64 {
    a.separation(b).to_radians().to_arcsec()
}

/// Greenwich mean sidereal time in degrees
pub fn gmst(time: DateTime<Utc>) -> f64 {
    let jd = julian_date(time);
    (280.46061837 + 360.98564736629 * (jd - 2451545.0)).rem_euclid(360.)
}

pub fn julian_date(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 86_400_000. + 2440587.5
}

/// Horizontal coordinates (altitude, azimuth) in degrees, azimuth measured from North through East
pub fn radec_to_altaz(ra: f64, dec: f64, site: &Site, time: DateTime<Utc>) -> (f64, f64) {
    let ha = (gmst(time) + site.lon - ra).to_radians();
    let (dec, lat) = (dec.to_radians(), site.lat.to_radians());
    let alt = (dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos()).asin();
    let az = (-ha.sin() * dec.cos()).atan2(dec.sin() * lat.cos() - dec.cos() * lat.sin() * ha.cos());
    (alt.to_degrees(), az.to_degrees().rem_euclid(360.))
}

/// The RA whose hour angle is zero at `site` and `time`, i.e. the local sidereal time
pub fn local_sidereal_time(site: &Site, time: DateTime<Utc>) -> f64 {
    (gmst(time) + site.lon).rem_euclid(360.)
}
