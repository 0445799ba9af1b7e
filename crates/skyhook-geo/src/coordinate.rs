use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{wrap_heading, VectorNED, EARTH_RADIUS_M};

/// Absolute point in WGS84 space.
///
/// Altitude is in meters relative to the takeoff ("home") position, not MSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt: f64,
    /// Optional label carried through waypoint lists and log lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            lat,
            lon,
            alt,
            name: None,
        }
    }

    pub fn named(lat: f64, lon: f64, alt: f64, name: impl Into<String>) -> Self {
        Self {
            lat,
            lon,
            alt,
            name: Some(name.into()),
        }
    }

    /// True when latitude/longitude/altitude are finite and within WGS84
    /// bounds. Command-level validation lives in the safety crate; this is
    /// the raw geometric invariant.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.alt.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Horizontal great-circle distance in meters (haversine).
    pub fn ground_distance_to(&self, other: &Coordinate) -> f64 {
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// 3D distance in meters: haversine ground distance with the altitude
    /// delta folded in as a hypotenuse.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let ground = self.ground_distance_to(other);
        ground.hypot(other.alt - self.alt)
    }

    /// Initial bearing toward `other` in compass degrees (0 = north),
    /// wrapped to `[0, 360)`. Coincident points default to north.
    pub fn bearing_to(&self, other: &Coordinate) -> f64 {
        let d_lat = other.lat - self.lat;
        let d_lon = other.lon - self.lon;
        if d_lat.abs() < 1e-10 && d_lon.abs() < 1e-10 {
            return 0.0;
        }
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let dl = (other.lon - self.lon).to_radians();
        let y = dl.sin() * phi2.cos();
        let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dl.cos();
        wrap_heading(y.atan2(x).to_degrees())
    }

    /// Displace this point by a local NED vector. Positive `down` lowers
    /// the altitude.
    pub fn offset_by(&self, v: VectorNED) -> Coordinate {
        let d_lat = v.north / EARTH_RADIUS_M;
        let d_lon = v.east / (EARTH_RADIUS_M * self.lat.to_radians().cos());
        Coordinate::new(
            self.lat + d_lat.to_degrees(),
            self.lon + d_lon.to_degrees(),
            self.alt - v.down,
        )
    }

    /// NED displacement from this point to `other`. Inverse of
    /// [`offset_by`](Self::offset_by) for small separations.
    pub fn vector_to(&self, other: &Coordinate) -> VectorNED {
        let lat_mid = ((self.lat + other.lat) / 2.0).to_radians();
        VectorNED {
            north: (other.lat - self.lat).to_radians() * EARTH_RADIUS_M,
            east: (other.lon - self.lon).to_radians() * EARTH_RADIUS_M * lat_mid.cos(),
            down: self.alt - other.alt,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({:.6}, {:.6}, {:.1}m)", name, self.lat, self.lon, self.alt),
            None => write!(f, "({:.6}, {:.6}, {:.1}m)", self.lat, self.lon, self.alt),
        }
    }
}
