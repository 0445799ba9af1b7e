use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::Coordinate;

/// MAV_CMD ids carried by QGroundControl `.plan` mission items.
const PLAN_CMD_WAYPOINT: u32 = 16;
const PLAN_CMD_RTL: u32 = 20;
const PLAN_CMD_TAKEOFF: u32 = 22;
const PLAN_CMD_CHANGE_SPEED: u32 = 178;

pub const DEFAULT_ACCEPTANCE_RADIUS_M: f64 = 2.0;

/// A navigation target with per-leg tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub coordinate: Coordinate,
    /// Groundspeed for the leg toward this waypoint; `None` keeps the
    /// current cruise speed.
    pub speed: Option<f64>,
    pub acceptance_radius: f64,
    pub hold_time: Duration,
    pub name: Option<String>,
}

impl Waypoint {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            speed: None,
            acceptance_radius: DEFAULT_ACCEPTANCE_RADIUS_M,
            hold_time: Duration::ZERO,
            name: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_acceptance_radius(mut self, radius: f64) -> Self {
        self.acceptance_radius = radius;
        self
    }

    pub fn with_hold_time(mut self, hold: Duration) -> Self {
        self.hold_time = hold;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a QGroundControl plan file (fileType = {0:?})")]
    WrongFileType(String),
    #[error("mission item {index} has malformed params")]
    MalformedItem { index: usize },
}

#[derive(Deserialize)]
struct PlanFile {
    #[serde(rename = "fileType")]
    file_type: String,
    mission: PlanMission,
}

#[derive(Deserialize)]
struct PlanMission {
    items: Vec<PlanItem>,
}

#[derive(Deserialize)]
struct PlanItem {
    command: u32,
    // QGC writes `null` for unused params.
    params: Vec<Option<f64>>,
    #[serde(rename = "doJumpId", default)]
    do_jump_id: Option<u32>,
}

/// Parse a QGroundControl `.plan` file into waypoints, in mission order.
///
/// Nav items (takeoff, waypoint, RTL) yield waypoints from `params[4..7]`;
/// `DO_CHANGE_SPEED` items update the speed applied to subsequent legs.
/// Hold time for waypoints comes from `params[0]`.
pub fn read_plan(path: impl AsRef<Path>) -> Result<Vec<Waypoint>, PlanError> {
    let raw = std::fs::read_to_string(path)?;
    let plan: PlanFile = serde_json::from_str(&raw)?;
    if plan.file_type != "Plan" {
        return Err(PlanError::WrongFileType(plan.file_type));
    }

    let mut waypoints = Vec::new();
    let mut current_speed: Option<f64> = None;
    for (index, item) in plan.mission.items.iter().enumerate() {
        match item.command {
            PLAN_CMD_CHANGE_SPEED => {
                current_speed = item.params.get(1).copied().flatten();
            }
            PLAN_CMD_WAYPOINT | PLAN_CMD_TAKEOFF | PLAN_CMD_RTL => {
                let get = |i: usize| item.params.get(i).copied().flatten();
                let (lat, lon, alt) = match (get(4), get(5), get(6)) {
                    (Some(lat), Some(lon), Some(alt)) => (lat, lon, alt),
                    _ => return Err(PlanError::MalformedItem { index }),
                };
                let hold = get(0).unwrap_or(0.0).max(0.0);
                let mut wp = Waypoint::new(Coordinate::new(lat, lon, alt))
                    .with_hold_time(Duration::from_secs_f64(hold));
                wp.speed = current_speed;
                if let Some(id) = item.do_jump_id {
                    wp = wp.with_name(format!("wp-{id}"));
                }
                waypoints.push(wp);
            }
            _ => {}
        }
    }
    Ok(waypoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_PLAN: &str = r#"{
        "fileType": "Plan",
        "groundStation": "QGroundControl",
        "mission": {
            "items": [
                {"command": 22, "doJumpId": 1, "params": [0, 0, 0, null, 35.7275, -78.696, 20]},
                {"command": 178, "doJumpId": 2, "params": [1, 7.5, -1, 0, 0, 0, 0]},
                {"command": 16, "doJumpId": 3, "params": [5, 0, 0, null, 35.7281, -78.6954, 20]},
                {"command": 20, "doJumpId": 4, "params": [0, 0, 0, null, 35.7275, -78.696, 0]}
            ]
        },
        "version": 1
    }"#;

    fn write_plan(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn reads_nav_items_in_order() {
        let f = write_plan(SAMPLE_PLAN);
        let wps = read_plan(f.path()).unwrap();
        assert_eq!(wps.len(), 3);
        assert_eq!(wps[0].coordinate.alt, 20.0);
        assert_eq!(wps[0].speed, None);
        assert_eq!(wps[1].speed, Some(7.5));
        assert_eq!(wps[1].hold_time, Duration::from_secs(5));
        assert_eq!(wps[2].coordinate.lat, 35.7275);
        assert_eq!(wps[2].name.as_deref(), Some("wp-4"));
    }

    #[test]
    fn rejects_non_plan_files() {
        let f = write_plan(r#"{"fileType": "GeoFence", "mission": {"items": []}}"#);
        assert!(matches!(
            read_plan(f.path()),
            Err(PlanError::WrongFileType(_))
        ));
    }
}
