use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mavlink::common::{
    MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag, MavState, MavType,
    PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, SET_POSITION_TARGET_GLOBAL_INT_DATA,
    SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use mavlink::{MavConnection, MavHeader};
use tracing::{debug, trace, warn};

use skyhook_geo::{Coordinate, VectorNED};

use crate::adapter::{LinkBackend, LinkCommand};
use crate::telemetry::{BatteryInfo, FlightMode, GpsInfo, LandedState, TelemetryFrame, TelemetryStore};
use crate::{Endpoint, LinkError};

/// Magic param2 value that forces a disarm mid-air (MAV_CMD_COMPONENT_ARM_DISARM).
const FORCE_DISARM_MAGIC: f32 = 21196.0;

/// Link backend over the `mavlink` crate, `common` dialect.
///
/// Telemetry is pumped on a blocking task (socket reads block); commands go
/// out as COMMAND_LONG / SET_POSITION_TARGET messages. A 1 Hz companion
/// heartbeat keeps ground-side failsafes quiet.
pub struct MavlinkLink {
    conn: Arc<Box<dyn MavConnection<MavMessage> + Sync + Send>>,
    sequence: Arc<AtomicU8>,
    system_id: u8,
    component_id: u8,
    target_system: u8,
    target_component: u8,
    running: Arc<AtomicBool>,
}

impl MavlinkLink {
    pub fn connect(endpoint: &Endpoint) -> Result<Self, LinkError> {
        Self::connect_with_ids(endpoint, 245, 190, 1, 1)
    }

    pub fn connect_with_ids(
        endpoint: &Endpoint,
        system_id: u8,
        component_id: u8,
        target_system: u8,
        target_component: u8,
    ) -> Result<Self, LinkError> {
        let address = endpoint.mavlink_address();
        let conn = mavlink::connect::<MavMessage>(&address).map_err(|source| LinkError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
        debug!(%endpoint, "mavlink connection open");
        Ok(Self {
            conn: Arc::new(conn),
            sequence: Arc::new(AtomicU8::new(0)),
            system_id,
            component_id,
            target_system,
            target_component,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn send_message(&self, msg: MavMessage) -> Result<(), LinkError> {
        self.conn
            .send(&self.header(), &msg)
            .map(|_| ())
            .map_err(|e| LinkError::Send(e.to_string()))
    }

    fn command_long(&self, command: MavCmd, params: [f32; 7]) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            command: command.into(),
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        })
    }

    fn heartbeat(&self) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn goto_setpoint(&self, lat: f64, lon: f64, alt: f64, yaw: Option<f64>) -> MavMessage {
        let mut mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;
        if yaw.is_none() {
            mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
        }
        MavMessage::SET_POSITION_TARGET_GLOBAL_INT(SET_POSITION_TARGET_GLOBAL_INT_DATA {
            time_boot_ms: 0,
            target_system: self.target_system,
            target_component: self.target_component,
            coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            type_mask: mask,
            lat_int: (lat * 1e7) as i32,
            lon_int: (lon * 1e7) as i32,
            alt: alt as f32,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: yaw.unwrap_or(0.0).to_radians() as f32,
            yaw_rate: 0.0,
        })
    }

    fn velocity_setpoint(&self, velocity: VectorNED, yaw: Option<f64>) -> MavMessage {
        let mut mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;
        if yaw.is_none() {
            mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
        }
        MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: 0,
            target_system: self.target_system,
            target_component: self.target_component,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            type_mask: mask,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx: velocity.north as f32,
            vy: velocity.east as f32,
            vz: velocity.down as f32,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: yaw.unwrap_or(0.0).to_radians() as f32,
            yaw_rate: 0.0,
        })
    }
}

#[async_trait]
impl LinkBackend for MavlinkLink {
    async fn start(&self, store: TelemetryStore) -> Result<(), LinkError> {
        self.running.store(true, Ordering::SeqCst);

        // Reader: mavlink recv blocks, so it lives on the blocking pool.
        let conn = self.conn.clone();
        let running = self.running.clone();
        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                match conn.recv() {
                    Ok((_header, msg)) => {
                        for frame in decode(&msg) {
                            store.apply(frame);
                        }
                    }
                    Err(e) => {
                        trace!("mavlink recv error: {e}");
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });

        // Companion heartbeat at 1 Hz.
        let conn = self.conn.clone();
        let running = self.running.clone();
        let hb = self.heartbeat();
        let header_ids = (self.system_id, self.component_id);
        let sequence = self.sequence.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let header = MavHeader {
                    system_id: header_ids.0,
                    component_id: header_ids.1,
                    sequence: sequence.fetch_add(1, Ordering::Relaxed),
                };
                if let Err(e) = conn.send(&header, &hb) {
                    warn!("heartbeat send failed: {e}");
                }
            }
        });

        Ok(())
    }

    async fn send(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let msg = match cmd {
            LinkCommand::Arm => {
                self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            }
            LinkCommand::Disarm { force } => {
                let magic = if force { FORCE_DISARM_MAGIC } else { 0.0 };
                self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0, magic, 0.0, 0.0, 0.0, 0.0, 0.0])
            }
            LinkCommand::Takeoff { altitude } => self.command_long(
                MavCmd::MAV_CMD_NAV_TAKEOFF,
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude as f32],
            ),
            LinkCommand::Land => {
                self.command_long(MavCmd::MAV_CMD_NAV_LAND, [0.0; 7])
            }
            LinkCommand::ReturnToLaunch => {
                self.command_long(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7])
            }
            LinkCommand::Hold => {
                self.command_long(MavCmd::MAV_CMD_NAV_LOITER_UNLIM, [0.0; 7])
            }
            LinkCommand::SetMaximumSpeed { speed } => self.command_long(
                MavCmd::MAV_CMD_DO_CHANGE_SPEED,
                [1.0, speed as f32, -1.0, 0.0, 0.0, 0.0, 0.0],
            ),
            LinkCommand::GotoLocation { lat, lon, alt, yaw } => self.goto_setpoint(lat, lon, alt, yaw),
            LinkCommand::SetVelocityNed { velocity, yaw } => self.velocity_setpoint(velocity, yaw),
            LinkCommand::StartOrbit {
                lat,
                lon,
                radius,
                speed,
                clockwise,
            } => {
                let signed_radius = if clockwise { radius } else { -radius };
                self.command_long(
                    MavCmd::MAV_CMD_DO_ORBIT,
                    [
                        signed_radius as f32,
                        speed as f32,
                        0.0,
                        0.0,
                        lat as f32,
                        lon as f32,
                        0.0,
                    ],
                )
            }
        };
        self.send_message(msg)
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// ArduPilot copter custom-mode numbers we care about.
fn map_flight_mode(custom_mode: u32) -> FlightMode {
    match custom_mode {
        0 => FlightMode::Manual,
        3 => FlightMode::Mission,
        4 => FlightMode::Guided,
        5 => FlightMode::Hold,
        6 => FlightMode::ReturnToLaunch,
        9 => FlightMode::Land,
        other => FlightMode::Other(other),
    }
}

fn map_landed_state(state: MavLandedState) -> LandedState {
    match state {
        MavLandedState::MAV_LANDED_STATE_ON_GROUND => LandedState::OnGround,
        MavLandedState::MAV_LANDED_STATE_IN_AIR => LandedState::InAir,
        MavLandedState::MAV_LANDED_STATE_TAKEOFF => LandedState::TakingOff,
        MavLandedState::MAV_LANDED_STATE_LANDING => LandedState::Landing,
        MavLandedState::MAV_LANDED_STATE_UNDEFINED => LandedState::Unknown,
    }
}

/// Decode one wire message into telemetry frames.
fn decode(msg: &MavMessage) -> Vec<TelemetryFrame> {
    match msg {
        MavMessage::HEARTBEAT(data) => {
            // Only the autopilot's own heartbeat carries vehicle state.
            if data.mavtype == MavType::MAV_TYPE_GCS
                || data.mavtype == MavType::MAV_TYPE_ONBOARD_CONTROLLER
            {
                return Vec::new();
            }
            vec![TelemetryFrame::Heartbeat {
                flight_mode: map_flight_mode(data.custom_mode),
                armed: data
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
            }]
        }
        MavMessage::GLOBAL_POSITION_INT(data) => {
            let mut frames = vec![
                TelemetryFrame::Position {
                    lat: data.lat as f64 / 1e7,
                    lon: data.lon as f64 / 1e7,
                    alt: data.relative_alt as f64 / 1e3,
                },
                TelemetryFrame::VelocityNed(VectorNED::new(
                    data.vx as f64 / 100.0,
                    data.vy as f64 / 100.0,
                    data.vz as f64 / 100.0,
                )),
            ];
            if data.hdg != u16::MAX {
                frames.push(TelemetryFrame::Heading(data.hdg as f64 / 100.0));
            }
            frames
        }
        MavMessage::VFR_HUD(data) => vec![TelemetryFrame::Hud {
            airspeed: data.airspeed as f64,
            groundspeed: data.groundspeed as f64,
            climb_rate: data.climb as f64,
        }],
        MavMessage::SYS_STATUS(data) => {
            // voltage in mV, current in cA, remaining in %; sentinel values
            // mean "not measured" and are reported as zero.
            let voltage = if data.voltage_battery != u16::MAX {
                data.voltage_battery as f64 / 1000.0
            } else {
                0.0
            };
            let current = if data.current_battery != -1 {
                data.current_battery as f64 / 100.0
            } else {
                0.0
            };
            let percentage = if data.battery_remaining >= 0 {
                data.battery_remaining as f64
            } else {
                0.0
            };
            vec![TelemetryFrame::Battery(BatteryInfo {
                voltage,
                current,
                percentage,
            })]
        }
        MavMessage::GPS_RAW_INT(data) => vec![TelemetryFrame::Gps(GpsInfo {
            fix_type: data.fix_type as u8,
            satellites: data.satellites_visible as u32,
            lat: data.lat as f64 / 1e7,
            lon: data.lon as f64 / 1e7,
        })],
        MavMessage::EXTENDED_SYS_STATE(data) => {
            let landed = map_landed_state(data.landed_state);
            vec![
                TelemetryFrame::Landed(landed),
                TelemetryFrame::InAir(matches!(
                    landed,
                    LandedState::InAir | LandedState::TakingOff | LandedState::Landing
                )),
            ]
        }
        MavMessage::HOME_POSITION(data) => vec![TelemetryFrame::Home(Coordinate::new(
            data.latitude as f64 / 1e7,
            data.longitude as f64 / 1e7,
            0.0,
        ))],
        _ => Vec::new(),
    }
}
