use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::wrap_heading;

/// Displacement or velocity in the local NED frame (meters / m/s).
///
/// North and east are world-aligned; down is positive toward the ground.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorNED {
    pub north: f64,
    pub east: f64,
    pub down: f64,
}

impl VectorNED {
    pub fn new(north: f64, east: f64, down: f64) -> Self {
        Self { north, east, down }
    }

    pub const ZERO: VectorNED = VectorNED {
        north: 0.0,
        east: 0.0,
        down: 0.0,
    };

    /// Vector magnitude. With `ignore_down` the down component is dropped,
    /// giving the horizontal (ground) magnitude.
    pub fn magnitude(&self, ignore_down: bool) -> f64 {
        if ignore_down {
            self.north.hypot(self.east)
        } else {
            (self.north * self.north + self.east * self.east + self.down * self.down).sqrt()
        }
    }

    /// Unit vector in the same direction. The zero vector normalizes to
    /// zero.
    pub fn normalized(&self) -> VectorNED {
        let m = self.magnitude(false);
        if m == 0.0 {
            VectorNED::ZERO
        } else {
            *self * (1.0 / m)
        }
    }

    /// Rotate the horizontal components by `angle_deg` about the down axis
    /// (right-hand rule: +90 degrees takes north into east). Down is
    /// unchanged.
    pub fn rotate_by_angle(&self, angle_deg: f64) -> VectorNED {
        let rad = angle_deg.to_radians();
        let (sin, cos) = rad.sin_cos();
        VectorNED {
            north: self.north * cos - self.east * sin,
            east: self.north * sin + self.east * cos,
            down: self.down,
        }
    }

    /// Compass bearing of the horizontal component in `[0, 360)`. The zero
    /// vector reports north.
    pub fn heading(&self) -> f64 {
        if self.north == 0.0 && self.east == 0.0 {
            return 0.0;
        }
        wrap_heading(self.east.atan2(self.north).to_degrees())
    }
}

impl Add for VectorNED {
    type Output = VectorNED;

    fn add(self, o: VectorNED) -> VectorNED {
        VectorNED::new(self.north + o.north, self.east + o.east, self.down + o.down)
    }
}

impl Sub for VectorNED {
    type Output = VectorNED;

    fn sub(self, o: VectorNED) -> VectorNED {
        VectorNED::new(self.north - o.north, self.east - o.east, self.down - o.down)
    }
}

impl Neg for VectorNED {
    type Output = VectorNED;

    fn neg(self) -> VectorNED {
        VectorNED::new(-self.north, -self.east, -self.down)
    }
}

impl Mul<f64> for VectorNED {
    type Output = VectorNED;

    fn mul(self, scalar: f64) -> VectorNED {
        VectorNED::new(self.north * scalar, self.east * scalar, self.down * scalar)
    }
}
