use std::time::Duration;

use skyhook_geo::{Coordinate, VectorNED};

use crate::SafetyLimits;

pub const MIN_TOLERANCE_M: f64 = 0.1;
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Outcome of validating one command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub ok: bool,
    pub parameter: &'static str,
    pub message: Option<String>,
    pub value: Option<f64>,
    pub limit: Option<f64>,
}

impl ValidationResult {
    fn pass(parameter: &'static str, value: Option<f64>) -> Self {
        Self {
            ok: true,
            parameter,
            message: None,
            value,
            limit: None,
        }
    }

    fn fail(
        parameter: &'static str,
        message: impl Into<String>,
        value: Option<f64>,
        limit: Option<f64>,
    ) -> Self {
        Self {
            ok: false,
            parameter,
            message: Some(message.into()),
            value,
            limit,
        }
    }
}

/// Coordinates must be finite and within WGS84 bounds. Checked regardless
/// of the `enable_parameter_validation` toggle; a NaN target is never
/// flyable.
pub fn validate_coordinate(coordinate: &Coordinate) -> ValidationResult {
    if coordinate.is_valid() {
        ValidationResult::pass("coordinate", None)
    } else {
        ValidationResult::fail(
            "coordinate",
            format!(
                "coordinate out of range: lat={}, lon={}, alt={}",
                coordinate.lat, coordinate.lon, coordinate.alt
            ),
            None,
            None,
        )
    }
}

pub fn validate_altitude(altitude: f64, limits: &SafetyLimits) -> ValidationResult {
    if !altitude.is_finite() {
        return ValidationResult::fail("altitude", "altitude is not finite", None, None);
    }
    if !limits.enable_parameter_validation {
        return ValidationResult::pass("altitude", Some(altitude));
    }
    if altitude < limits.min_altitude {
        ValidationResult::fail(
            "altitude",
            format!("altitude {altitude}m below minimum {}m", limits.min_altitude),
            Some(altitude),
            Some(limits.min_altitude),
        )
    } else if altitude > limits.max_altitude {
        ValidationResult::fail(
            "altitude",
            format!("altitude {altitude}m above maximum {}m", limits.max_altitude),
            Some(altitude),
            Some(limits.max_altitude),
        )
    } else {
        ValidationResult::pass("altitude", Some(altitude))
    }
}

pub fn validate_speed(speed: f64, limits: &SafetyLimits) -> ValidationResult {
    if !speed.is_finite() || speed <= 0.0 {
        return ValidationResult::fail(
            "speed",
            format!("speed must be positive and finite, got {speed}"),
            Some(speed),
            None,
        );
    }
    if limits.enable_parameter_validation && limits.enable_speed_limits && speed > limits.max_speed
    {
        return ValidationResult::fail(
            "speed",
            format!("speed {speed} m/s exceeds limit {} m/s", limits.max_speed),
            Some(speed),
            Some(limits.max_speed),
        );
    }
    ValidationResult::pass("speed", Some(speed))
}

/// Component-wise velocity check: finite components, horizontal magnitude
/// within `max_speed`, vertical component within `max_vertical_speed`.
pub fn validate_velocity(velocity: &VectorNED, limits: &SafetyLimits) -> ValidationResult {
    if !(velocity.north.is_finite() && velocity.east.is_finite() && velocity.down.is_finite()) {
        return ValidationResult::fail("velocity", "velocity has non-finite component", None, None);
    }
    if !limits.enable_parameter_validation || !limits.enable_speed_limits {
        return ValidationResult::pass("velocity", None);
    }
    let horizontal = velocity.magnitude(true);
    if horizontal > limits.max_speed {
        return ValidationResult::fail(
            "velocity",
            format!(
                "horizontal speed {horizontal:.2} m/s exceeds limit {} m/s",
                limits.max_speed
            ),
            Some(horizontal),
            Some(limits.max_speed),
        );
    }
    if velocity.down.abs() > limits.max_vertical_speed {
        return ValidationResult::fail(
            "velocity",
            format!(
                "vertical speed {:.2} m/s exceeds limit {} m/s",
                velocity.down.abs(),
                limits.max_vertical_speed
            ),
            Some(velocity.down.abs()),
            Some(limits.max_vertical_speed),
        );
    }
    ValidationResult::pass("velocity", None)
}

pub fn validate_tolerance(tolerance: f64) -> ValidationResult {
    if tolerance.is_finite() && tolerance >= MIN_TOLERANCE_M {
        ValidationResult::pass("tolerance", Some(tolerance))
    } else {
        ValidationResult::fail(
            "tolerance",
            format!("tolerance must be at least {MIN_TOLERANCE_M}m, got {tolerance}"),
            Some(tolerance),
            Some(MIN_TOLERANCE_M),
        )
    }
}

pub fn validate_timeout(timeout: Duration) -> ValidationResult {
    if timeout > Duration::ZERO && timeout <= MAX_TIMEOUT {
        ValidationResult::pass("timeout", Some(timeout.as_secs_f64()))
    } else {
        ValidationResult::fail(
            "timeout",
            format!(
                "timeout must be within (0, {}s], got {}s",
                MAX_TIMEOUT.as_secs(),
                timeout.as_secs_f64()
            ),
            Some(timeout.as_secs_f64()),
            Some(MAX_TIMEOUT.as_secs_f64()),
        )
    }
}

/// Clamp a requested speed into `(0, max_speed]`.
pub fn clamp_speed(speed: f64, limits: &SafetyLimits) -> f64 {
    speed.min(limits.max_speed)
}

/// Clamp a velocity: the horizontal vector is scaled uniformly so its
/// magnitude stays within `max_speed` (direction preserved); the vertical
/// component is clamped independently.
pub fn clamp_velocity(velocity: &VectorNED, limits: &SafetyLimits) -> VectorNED {
    let horizontal = velocity.magnitude(true);
    let scale = if horizontal > limits.max_speed {
        limits.max_speed / horizontal
    } else {
        1.0
    };
    VectorNED {
        north: velocity.north * scale,
        east: velocity.east * scale,
        down: velocity
            .down
            .clamp(-limits.max_vertical_speed, limits.max_vertical_speed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn speed_validation_respects_limit() {
        let limits = SafetyLimits::default();
        assert!(validate_speed(5.0, &limits).ok);
        let res = validate_speed(limits.max_speed + 1.0, &limits);
        assert!(!res.ok);
        assert_eq!(res.limit, Some(limits.max_speed));
        assert!(!validate_speed(-1.0, &limits).ok);
        assert!(!validate_speed(f64::NAN, &limits).ok);
    }

    #[test]
    fn disabled_limits_pass_fast_speeds() {
        let limits = SafetyLimits::disabled();
        assert!(validate_speed(1000.0, &limits).ok);
        assert!(validate_velocity(&VectorNED::new(80.0, 0.0, 40.0), &limits).ok);
        // Nonsense values still fail.
        assert!(!validate_speed(-3.0, &limits).ok);
    }

    #[test]
    fn clamp_speed_is_identity_below_limit() {
        let limits = SafetyLimits::default();
        for s in [0.0, 1.0, limits.max_speed] {
            assert_relative_eq!(clamp_speed(s, &limits), s);
        }
        assert_relative_eq!(clamp_speed(limits.max_speed + 7.0, &limits), limits.max_speed);
    }

    #[test]
    fn clamp_velocity_preserves_direction() {
        let limits = SafetyLimits::default();
        let v = VectorNED::new(30.0, 40.0, 9.0);
        let clamped = clamp_velocity(&v, &limits);
        assert_relative_eq!(clamped.magnitude(true), limits.max_speed, epsilon = 1e-9);
        assert_relative_eq!(clamped.heading(), v.heading(), epsilon = 1e-9);
        assert_relative_eq!(clamped.down, limits.max_vertical_speed);

        let slow = VectorNED::new(1.0, 1.0, -0.5);
        assert_eq!(clamp_velocity(&slow, &limits), slow);
    }

    #[test]
    fn velocity_validation_checks_both_axes() {
        let limits = SafetyLimits::default();
        assert!(validate_velocity(&VectorNED::new(3.0, 4.0, 1.0), &limits).ok);
        assert!(!validate_velocity(&VectorNED::new(30.0, 0.0, 0.0), &limits).ok);
        assert!(!validate_velocity(&VectorNED::new(0.0, 0.0, 5.0), &limits).ok);
        assert!(!validate_velocity(&VectorNED::new(0.0, 0.0, -5.0), &limits).ok);
    }

    #[test]
    fn coordinate_and_tolerance_and_timeout() {
        assert!(validate_coordinate(&Coordinate::new(35.7, -78.7, 10.0)).ok);
        assert!(!validate_coordinate(&Coordinate::new(135.7, 0.0, 0.0)).ok);
        assert!(validate_tolerance(2.0).ok);
        assert!(!validate_tolerance(0.01).ok);
        assert!(validate_timeout(Duration::from_secs(300)).ok);
        assert!(!validate_timeout(Duration::ZERO).ok);
        assert!(!validate_timeout(Duration::from_secs(7200)).ok);
    }

    #[test]
    fn altitude_bounds() {
        let limits = SafetyLimits::default();
        assert!(validate_altitude(50.0, &limits).ok);
        assert!(!validate_altitude(limits.max_altitude + 1.0, &limits).ok);
        assert!(!validate_altitude(-5.0, &limits).ok);
        assert!(!validate_altitude(f64::INFINITY, &limits).ok);
    }
}
