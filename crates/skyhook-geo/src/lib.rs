//! Geodetic primitives shared across the skyhook workspace.
//!
//! Everything here is pure math over WGS84 points and local NED
//! displacements. No I/O apart from the `.plan` reader in [`waypoint`].

pub mod coordinate;
pub mod vector;
pub mod waypoint;

pub use coordinate::Coordinate;
pub use vector::VectorNED;
pub use waypoint::{read_plan, PlanError, Waypoint};

/// Mean Earth radius in meters, shared by the haversine distance and the
/// NED offset conversions so that `offset_by` and `vector_to` invert each
/// other.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Normalize a compass heading into `[0, 360)`.
pub fn wrap_heading(deg: f64) -> f64 {
    deg.rem_euclid(360.0)
}

/// Signed shortest angular difference `target - current`, in `(-180, 180]`.
pub fn heading_difference(current: f64, target: f64) -> f64 {
    let mut diff = (target - current).rem_euclid(360.0);
    if diff > 180.0 {
        diff -= 360.0;
    }
    diff
}
