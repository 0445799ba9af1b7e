use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use skyhook_link::Snapshot;

use crate::SafetyLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub message: String,
}

/// Result of the pre-arm check suite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub checks: BTreeMap<String, CheckOutcome>,
    pub warnings: Vec<String>,
}

impl PreflightResult {
    pub fn ok(&self) -> bool {
        self.checks.values().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|(_, outcome)| !outcome.passed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn record(&mut self, name: &str, passed: bool, message: impl Into<String>) {
        self.checks.insert(
            name.to_string(),
            CheckOutcome {
                passed,
                message: message.into(),
            },
        );
    }
}

/// Run the named pre-arm checks (`config`, `gps`, `battery`, `connection`)
/// against the current telemetry.
///
/// Pure over its inputs so missions and tests can evaluate it directly;
/// `arm()` invokes it unless preflight is skipped or forced.
pub fn run_preflight_checks(
    snapshot: &Snapshot,
    limits: &SafetyLimits,
    link_alive: bool,
) -> PreflightResult {
    let mut result = PreflightResult::default();

    match limits.validate() {
        Ok(()) => result.record("config", true, "safety limits consistent"),
        Err(reason) => result.record("config", false, reason),
    }

    if limits.require_gps_fix {
        match &snapshot.gps {
            None => result.record("gps", false, "no GPS telemetry received"),
            Some(gps) if !gps.has_3d_fix() => result.record(
                "gps",
                false,
                format!("no 3D fix (fix_type={})", gps.fix_type),
            ),
            Some(gps) if gps.satellites < limits.min_satellites => result.record(
                "gps",
                false,
                format!(
                    "{} satellites visible, need {}",
                    gps.satellites, limits.min_satellites
                ),
            ),
            Some(gps) => result.record(
                "gps",
                true,
                format!("3D fix with {} satellites", gps.satellites),
            ),
        }
    } else {
        result.record("gps", true, "GPS fix not required");
    }

    match &snapshot.battery {
        None => result.record("battery", false, "no battery telemetry received"),
        Some(battery) if battery.percentage < limits.min_battery_percent => result.record(
            "battery",
            false,
            format!(
                "battery {:.0}% below minimum {:.0}%",
                battery.percentage, limits.min_battery_percent
            ),
        ),
        Some(battery) => {
            if battery.percentage < limits.min_battery_percent + 5.0 {
                result.warnings.push(format!(
                    "battery {:.0}% is close to the {:.0}% minimum",
                    battery.percentage, limits.min_battery_percent
                ));
            }
            result.record("battery", true, format!("battery {:.0}%", battery.percentage));
        }
    }

    if !link_alive {
        result.record("connection", false, "link heartbeat lost");
    } else if snapshot.generation == 0 {
        result.record("connection", false, "no telemetry received yet");
    } else {
        result.record("connection", true, "link alive");
    }

    result
}
