//! Safety subsystem: parameter validation and clamping, preflight checks,
//! the runtime safety monitor, and the out-of-process geofence checker.

pub mod checker;
pub mod geofence;
pub mod monitor;
pub mod preflight;
pub mod validation;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use checker::{CheckReply, CheckRequest, GeofenceError, SafetyCheckerClient, SafetyCheckerServer, Verdict};
pub use geofence::GeofencePoint;
pub use monitor::{Failsafe, SafetyMonitor, SafetyViolation, SafetyViolationType};
pub use preflight::{run_preflight_checks, CheckOutcome, PreflightResult};
pub use validation::{
    clamp_speed, clamp_velocity, validate_altitude, validate_coordinate, validate_speed,
    validate_timeout, validate_tolerance, validate_velocity, ValidationResult,
};

/// Client-side safety configuration: numeric limits and feature toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Horizontal speed ceiling (m/s).
    pub max_speed: f64,
    /// Vertical speed ceiling, either direction (m/s).
    pub max_vertical_speed: f64,
    pub min_altitude: f64,
    pub max_altitude: f64,
    pub min_battery_percent: f64,
    pub critical_battery_percent: f64,
    pub require_gps_fix: bool,
    pub min_satellites: u32,
    pub enable_speed_limits: bool,
    pub enable_battery_failsafe: bool,
    pub enable_parameter_validation: bool,
    pub enable_preflight_checks: bool,
    /// Clamp out-of-range clampable parameters instead of rejecting them.
    pub auto_clamp_values: bool,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_speed: 10.0,
            max_vertical_speed: 3.0,
            min_altitude: 0.0,
            max_altitude: 120.0,
            min_battery_percent: 20.0,
            critical_battery_percent: 10.0,
            require_gps_fix: true,
            min_satellites: 6,
            enable_speed_limits: true,
            enable_battery_failsafe: true,
            enable_parameter_validation: true,
            enable_preflight_checks: true,
            auto_clamp_values: false,
        }
    }
}

impl SafetyLimits {
    /// Conservative preset for flights near people or structures.
    pub fn restrictive() -> Self {
        Self {
            max_speed: 5.0,
            max_vertical_speed: 2.0,
            max_altitude: 50.0,
            min_battery_percent: 30.0,
            critical_battery_percent: 15.0,
            min_satellites: 8,
            auto_clamp_values: true,
            ..Self::default()
        }
    }

    /// Loose preset for open test ranges.
    pub fn permissive() -> Self {
        Self {
            max_speed: 20.0,
            max_vertical_speed: 8.0,
            max_altitude: 400.0,
            min_battery_percent: 10.0,
            critical_battery_percent: 5.0,
            min_satellites: 4,
            auto_clamp_values: true,
            ..Self::default()
        }
    }

    /// Everything off. Parameter validation, preflight and the failsafe all
    /// become no-ops; monitoring still reports battery state.
    pub fn disabled() -> Self {
        Self {
            enable_speed_limits: false,
            enable_battery_failsafe: false,
            enable_parameter_validation: false,
            enable_preflight_checks: false,
            ..Self::default()
        }
    }

    /// Internal consistency of the limits themselves (preflight `config`
    /// check).
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_speed.is_finite() && self.max_speed > 0.0) {
            return Err(format!("max_speed must be positive, got {}", self.max_speed));
        }
        if !(self.max_vertical_speed.is_finite() && self.max_vertical_speed > 0.0) {
            return Err(format!(
                "max_vertical_speed must be positive, got {}",
                self.max_vertical_speed
            ));
        }
        if self.min_altitude > self.max_altitude {
            return Err(format!(
                "min_altitude {} exceeds max_altitude {}",
                self.min_altitude, self.max_altitude
            ));
        }
        if !(0.0..=100.0).contains(&self.min_battery_percent)
            || !(0.0..=100.0).contains(&self.critical_battery_percent)
        {
            return Err("battery thresholds must be within 0..=100".to_string());
        }
        if self.critical_battery_percent > self.min_battery_percent {
            return Err(format!(
                "critical_battery_percent {} exceeds min_battery_percent {}",
                self.critical_battery_percent, self.min_battery_percent
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Copter,
    Rover,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read safety config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse safety config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid safety config: {0}")]
    Invalid(String),
}

/// Server-side geofence configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub vehicle_type: VehicleType,
    pub min_speed: f64,
    pub max_speed: f64,
    pub min_altitude: f64,
    pub max_altitude: f64,
    /// Polygons the vehicle must stay inside. Empty means unbounded.
    #[serde(default)]
    pub include_geofences: Vec<Vec<GeofencePoint>>,
    /// No-go polygons.
    #[serde(default)]
    pub exclude_geofences: Vec<Vec<GeofencePoint>>,
    /// Also reject waypoints whose path crosses a geofence edge.
    #[serde(default)]
    pub validate_paths: bool,
}

impl SafetyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: SafetyConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_speed < 0.0 || self.max_speed <= 0.0 || self.min_speed > self.max_speed {
            return Err(ConfigError::Invalid(format!(
                "speed bounds [{}, {}] are inconsistent",
                self.min_speed, self.max_speed
            )));
        }
        if self.min_altitude > self.max_altitude {
            return Err(ConfigError::Invalid(format!(
                "altitude bounds [{}, {}] are inconsistent",
                self.min_altitude, self.max_altitude
            )));
        }
        for (i, polygon) in self
            .include_geofences
            .iter()
            .chain(self.exclude_geofences.iter())
            .enumerate()
        {
            if polygon.len() < 3 {
                return Err(ConfigError::Invalid(format!(
                    "geofence polygon {i} has fewer than 3 vertices"
                )));
            }
        }
        Ok(())
    }
}
