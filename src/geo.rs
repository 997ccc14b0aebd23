//! Geographic coordinates and great-circle distance.
//!
//! Both the live matcher and the fan-out planner measure proximity through
//! this module, so client-side and server-side geofences agree on every
//! boundary case.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Mean Earth radius used by the haversine formula, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated WGS84 position in decimal degrees.
///
/// Latitude is within `[-90, 90]` and longitude within `[-180, 180]`.
/// Out-of-range or non-finite input is rejected, never clamped.
///
/// # Examples
///
/// ```
/// use hazardwatch::Coordinate;
///
/// let here = Coordinate::new(10.0, 10.0).unwrap();
/// assert_eq!(here.lat(), 10.0);
/// assert!(Coordinate::new(91.0, 0.0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = ConfigurationError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lon)
    }
}

impl Coordinate {
    /// Creates a coordinate, validating both axes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::CoordinateOutOfRange` if either value is
    /// outside its range or not finite.
    pub fn new(lat: f64, lon: f64) -> Result<Self, ConfigurationError> {
        check_axis("latitude", lat, 90.0)?;
        check_axis("longitude", lon, 180.0)?;
        Ok(Self { lat, lon })
    }

    /// Latitude in degrees.
    #[must_use]
    pub const fn lat(&self) -> f64 {
        self.lat
    }

    /// Longitude in degrees.
    #[must_use]
    pub const fn lon(&self) -> f64 {
        self.lon
    }

    /// Great-circle distance to `other` in kilometres.
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        distance_km(*self, *other)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lat, self.lon)
    }
}

fn check_axis(field: &'static str, value: f64, bound: f64) -> Result<(), ConfigurationError> {
    // NaN fails the range test as well.
    if value.is_finite() && (-bound..=bound).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::CoordinateOutOfRange {
            field,
            value,
            min: -bound,
            max: bound,
        })
    }
}

/// Haversine distance between two coordinates, in kilometres.
///
/// Non-negative, symmetric, and zero for identical points.
///
/// ```
/// use hazardwatch::{distance_km, Coordinate};
///
/// let a = Coordinate::new(0.0, 0.0).unwrap();
/// let b = Coordinate::new(0.0, 1.0).unwrap();
/// assert!((distance_km(a, b) - 111.19).abs() < 0.5);
/// ```
#[must_use]
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let sin_lat = (d_lat / 2.0).sin();
    let sin_lon = (d_lon / 2.0).sin();
    let h = sin_lat * sin_lat + a.lat.to_radians().cos() * b.lat.to_radians().cos() * sin_lon * sin_lon;

    // Rounding can push h a hair past 1 for antipodal points.
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Returns the distance when `b` lies within `radius_km` of `a` (inclusive).
#[must_use]
pub fn within_radius(a: Coordinate, b: Coordinate, radius_km: f64) -> Option<f64> {
    let d = distance_km(a, b);
    (d <= radius_km).then_some(d)
}

/// Validates a geofence radius.
///
/// # Errors
///
/// Returns `ConfigurationError::InvalidRadius` unless the radius is finite and
/// strictly positive.
pub fn validate_radius(radius_km: f64) -> Result<f64, ConfigurationError> {
    if radius_km.is_finite() && radius_km > 0.0 {
        Ok(radius_km)
    } else {
        Err(ConfigurationError::InvalidRadius { value: radius_km })
    }
}
