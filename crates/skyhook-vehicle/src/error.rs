use std::time::Duration;

use thiserror::Error;

use skyhook_geo::Coordinate;
use skyhook_link::LinkError;
use skyhook_safety::{PreflightResult, ValidationResult};

/// Everything that can go wrong while commanding a vehicle.
///
/// Cloneable so a terminal command result can carry its error to every
/// awaiter; wire-level errors are flattened to their message for that.
#[derive(Debug, Clone, Error)]
pub enum VehicleError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("no telemetry within {timeout:?}")]
    ConnectionTimeout { timeout: Duration },
    #[error("heartbeat lost ({age:?} since last telemetry)")]
    HeartbeatLost { age: Duration },
    #[error("arm rejected: {0}")]
    Arm(String),
    #[error("pre-flight checks failed: {}", .result.failed_checks().join(", "))]
    PreflightCheckFailed { result: PreflightResult },
    #[error("takeoff failed: {0}")]
    Takeoff(String),
    #[error("takeoff timed out at {current_altitude:.1}m of {target_altitude:.1}m")]
    TakeoffTimeout {
        target_altitude: f64,
        current_altitude: f64,
    },
    #[error("landing failed: {0}")]
    Landing(String),
    #[error("landing timed out at {current_altitude:.1}m")]
    LandingTimeout { current_altitude: f64 },
    #[error("navigation failed: {reason}")]
    Navigation { reason: String },
    #[error("goto timed out with {distance_remaining:.1}m remaining")]
    GotoTimeout { distance_remaining: f64 },
    #[error("{command} timed out after {timeout:?}")]
    CommandTimeout {
        command: &'static str,
        timeout: Duration,
    },
    #[error("aborted: {reason}")]
    Abort { reason: String },
    #[error("command {command} was cancelled")]
    Cancelled { command: &'static str },
    #[error("command {active} is still running")]
    CommandBusy { active: &'static str },
    #[error("invalid parameter {parameter}: {message}")]
    ParameterValidation {
        parameter: String,
        message: String,
        value: Option<f64>,
        limit: Option<f64>,
    },
    #[error("speed {value} m/s exceeds limit {limit} m/s")]
    SpeedLimitExceeded { value: f64, limit: f64 },
    #[error("geofence violation: {reason}")]
    GeofenceViolation {
        current_position: Option<Coordinate>,
        target_position: Option<Coordinate>,
        reason: String,
    },
    #[error("geofence checker unavailable: {0}")]
    GeofenceUnavailable(String),
    #[error("telemetry field {0} has no value yet")]
    UnavailableTelemetry(&'static str),
    #[error("link error: {0}")]
    Link(String),
}

impl From<LinkError> for VehicleError {
    fn from(e: LinkError) -> Self {
        VehicleError::Link(e.to_string())
    }
}

impl VehicleError {
    /// Map a failed validation to the right error variant. Speed limit
    /// violations get their dedicated kind.
    pub fn from_validation(result: ValidationResult) -> Self {
        debug_assert!(!result.ok);
        match (result.parameter, result.value, result.limit) {
            ("speed", Some(value), Some(limit)) | ("velocity", Some(value), Some(limit)) => {
                VehicleError::SpeedLimitExceeded { value, limit }
            }
            _ => VehicleError::ParameterValidation {
                parameter: result.parameter.to_string(),
                message: result
                    .message
                    .unwrap_or_else(|| "validation failed".to_string()),
                value: result.value,
                limit: result.limit,
            },
        }
    }
}
