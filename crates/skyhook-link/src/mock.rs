use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use skyhook_geo::{Coordinate, VectorNED};

use crate::adapter::{LinkBackend, LinkCommand};
use crate::telemetry::{BatteryInfo, FlightMode, GpsInfo, LandedState, TelemetryFrame, TelemetryStore};
use crate::LinkError;

const CLIMB_RATE_M_S: f64 = 2.5;
const DESCENT_RATE_M_S: f64 = 1.5;

#[derive(Debug, Clone)]
enum Target {
    /// Hold position.
    Idle,
    Climb { to: f64 },
    Descend,
    Goto { lat: f64, lon: f64, alt: f64 },
    Velocity { v: VectorNED },
    Orbit {
        center: Coordinate,
        radius: f64,
        speed: f64,
        clockwise: bool,
        angle_rad: f64,
    },
    Rtl { landing: bool },
}

#[derive(Debug, Clone)]
struct SimState {
    pos: Coordinate,
    vel: VectorNED,
    heading: f64,
    armed: bool,
    in_air: bool,
    landed: LandedState,
    mode: FlightMode,
    battery: BatteryInfo,
    battery_drain_per_s: f64,
    gps: GpsInfo,
    home: Option<Coordinate>,
    cruise_speed: f64,
    target: Target,
}

impl Default for SimState {
    fn default() -> Self {
        // Lake Wheeler field, the usual SITL spawn.
        let pos = Coordinate::new(35.727436, -78.696587, 0.0);
        Self {
            gps: GpsInfo {
                fix_type: 3,
                satellites: 10,
                lat: pos.lat,
                lon: pos.lon,
            },
            pos,
            vel: VectorNED::ZERO,
            heading: 0.0,
            armed: false,
            in_air: false,
            landed: LandedState::OnGround,
            mode: FlightMode::Manual,
            battery: BatteryInfo {
                voltage: 12.6,
                current: 0.0,
                percentage: 100.0,
            },
            battery_drain_per_s: 0.0,
            home: None,
            cruise_speed: 5.0,
            target: Target::Idle,
        }
    }
}

/// Point-mass simulator behind the [`LinkBackend`] seam.
///
/// Integrates motion toward the last commanded target at a fixed timestep
/// and publishes the same frame stream a real link would, so the vehicle
/// core and mission runner can be exercised without SITL. Commands are
/// recorded for assertion in tests.
pub struct MockLink {
    sim: Arc<Mutex<SimState>>,
    sent: Arc<Mutex<Vec<LinkCommand>>>,
    running: Arc<AtomicBool>,
    tick: Duration,
    time_scale: f64,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            sim: Arc::new(Mutex::new(SimState::default())),
            sent: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            tick: Duration::from_millis(25),
            time_scale: 1.0,
        }
    }

    /// Simulate `scale` seconds of motion per wall-clock second. Keeps
    /// long scenarios (takeoff, orbit) fast in tests.
    pub fn accelerated(scale: f64) -> Self {
        let mut link = Self::new();
        link.time_scale = scale;
        link
    }

    /// Commands received so far, in order.
    pub fn sent(&self) -> Vec<LinkCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn position(&self) -> Coordinate {
        self.sim.lock().unwrap().pos.clone()
    }

    pub fn set_position(&self, pos: Coordinate) {
        self.sim.lock().unwrap().pos = pos;
    }

    pub fn set_battery_percent(&self, percentage: f64) {
        self.sim.lock().unwrap().battery.percentage = percentage;
    }

    pub fn set_battery_drain(&self, percent_per_s: f64) {
        self.sim.lock().unwrap().battery_drain_per_s = percent_per_s;
    }

    pub fn set_gps(&self, fix_type: u8, satellites: u32) {
        let mut sim = self.sim.lock().unwrap();
        sim.gps.fix_type = fix_type;
        sim.gps.satellites = satellites;
    }

    fn step(sim: &mut SimState, dt: f64) {
        sim.battery.percentage = (sim.battery.percentage - sim.battery_drain_per_s * dt).max(0.0);

        let target = sim.target.clone();
        match target {
            Target::Idle => {
                sim.vel = VectorNED::ZERO;
            }
            Target::Climb { to } => {
                sim.in_air = true;
                sim.landed = LandedState::TakingOff;
                sim.vel = VectorNED::new(0.0, 0.0, -CLIMB_RATE_M_S);
                sim.pos.alt += CLIMB_RATE_M_S * dt;
                if sim.pos.alt >= to {
                    sim.pos.alt = to;
                    sim.vel = VectorNED::ZERO;
                    sim.landed = LandedState::InAir;
                    sim.target = Target::Idle;
                }
            }
            Target::Descend => {
                sim.landed = LandedState::Landing;
                sim.vel = VectorNED::new(0.0, 0.0, DESCENT_RATE_M_S);
                sim.pos.alt -= DESCENT_RATE_M_S * dt;
                if sim.pos.alt <= 0.0 {
                    sim.pos.alt = 0.0;
                    sim.vel = VectorNED::ZERO;
                    sim.in_air = false;
                    sim.landed = LandedState::OnGround;
                    sim.armed = false;
                    sim.target = Target::Idle;
                }
            }
            Target::Goto { lat, lon, alt } => {
                let to = Coordinate::new(lat, lon, alt);
                let remaining = sim.pos.distance_to(&to);
                let step = sim.cruise_speed * dt;
                if remaining <= step {
                    sim.pos = to;
                    sim.vel = VectorNED::ZERO;
                } else {
                    let dir = sim.pos.vector_to(&to).normalized();
                    sim.pos = sim.pos.offset_by(dir * step);
                    sim.vel = dir * sim.cruise_speed;
                    if dir.magnitude(true) > 1e-9 {
                        sim.heading = dir.heading();
                    }
                }
            }
            Target::Velocity { v } => {
                sim.pos = sim.pos.offset_by(v * dt);
                sim.vel = v;
                if v.magnitude(true) > 1e-9 {
                    sim.heading = v.heading();
                }
                if sim.pos.alt <= 0.0 {
                    sim.pos.alt = 0.0;
                }
            }
            Target::Orbit {
                center,
                radius,
                speed,
                clockwise,
                mut angle_rad,
            } => {
                let dir = if clockwise { 1.0 } else { -1.0 };
                angle_rad += dir * (speed / radius) * dt;
                let radial = VectorNED::new(angle_rad.cos(), angle_rad.sin(), 0.0);
                let mut pos = center.offset_by(radial * radius);
                pos.alt = sim.pos.alt;
                sim.pos = pos;
                let tangent = VectorNED::new(-angle_rad.sin(), angle_rad.cos(), 0.0) * dir;
                sim.vel = tangent * speed;
                sim.heading = sim.vel.heading();
                sim.target = Target::Orbit {
                    center,
                    radius,
                    speed,
                    clockwise,
                    angle_rad,
                };
            }
            Target::Rtl { landing } => {
                let home = sim.home.clone().unwrap_or_else(|| sim.pos.clone());
                if landing {
                    sim.landed = LandedState::Landing;
                    sim.vel = VectorNED::new(0.0, 0.0, DESCENT_RATE_M_S);
                    sim.pos.alt -= DESCENT_RATE_M_S * dt;
                    if sim.pos.alt <= 0.0 {
                        sim.pos.alt = 0.0;
                        sim.vel = VectorNED::ZERO;
                        sim.in_air = false;
                        sim.landed = LandedState::OnGround;
                        sim.armed = false;
                        sim.target = Target::Idle;
                    }
                } else {
                    let over_home = Coordinate::new(home.lat, home.lon, sim.pos.alt);
                    let remaining = sim.pos.distance_to(&over_home);
                    let step = sim.cruise_speed * dt;
                    if remaining <= step.max(0.5) {
                        sim.pos.lat = home.lat;
                        sim.pos.lon = home.lon;
                        sim.target = Target::Rtl { landing: true };
                    } else {
                        let dir = sim.pos.vector_to(&over_home).normalized();
                        sim.pos = sim.pos.offset_by(dir * step);
                        sim.vel = dir * sim.cruise_speed;
                        sim.heading = dir.heading();
                    }
                }
            }
        }

        sim.gps.lat = sim.pos.lat;
        sim.gps.lon = sim.pos.lon;
    }

    fn publish(sim: &SimState, store: &TelemetryStore) {
        store.apply(TelemetryFrame::Heartbeat {
            flight_mode: sim.mode,
            armed: sim.armed,
        });
        store.apply(TelemetryFrame::Position {
            lat: sim.pos.lat,
            lon: sim.pos.lon,
            alt: sim.pos.alt,
        });
        store.apply(TelemetryFrame::VelocityNed(sim.vel));
        store.apply(TelemetryFrame::Heading(sim.heading));
        store.apply(TelemetryFrame::Hud {
            airspeed: sim.vel.magnitude(true),
            groundspeed: sim.vel.magnitude(true),
            climb_rate: -sim.vel.down,
        });
        store.apply(TelemetryFrame::Landed(sim.landed));
        store.apply(TelemetryFrame::InAir(sim.in_air));
        store.apply(TelemetryFrame::Battery(sim.battery));
        store.apply(TelemetryFrame::Gps(sim.gps));
        if let Some(home) = &sim.home {
            store.apply(TelemetryFrame::Home(home.clone()));
        }
    }
}

#[async_trait]
impl LinkBackend for MockLink {
    async fn start(&self, store: TelemetryStore) -> Result<(), LinkError> {
        self.running.store(true, Ordering::SeqCst);
        let sim = self.sim.clone();
        let running = self.running.clone();
        let tick = self.tick;
        let dt = tick.as_secs_f64() * self.time_scale;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let snapshot = {
                    let mut sim = sim.lock().unwrap();
                    Self::step(&mut sim, dt);
                    sim.clone()
                };
                Self::publish(&snapshot, &store);
            }
        });
        Ok(())
    }

    async fn send(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.sent.lock().unwrap().push(cmd.clone());
        let mut sim = self.sim.lock().unwrap();
        match cmd {
            LinkCommand::Arm => {
                sim.armed = true;
                sim.mode = FlightMode::Guided;
                let mut home = sim.pos.clone();
                home.alt = 0.0;
                sim.home = Some(home);
            }
            LinkCommand::Disarm { force } => {
                if sim.in_air && !force {
                    return Err(LinkError::Send("disarm rejected while in air".into()));
                }
                sim.armed = false;
            }
            LinkCommand::Takeoff { altitude } => {
                if !sim.armed {
                    return Err(LinkError::Send("takeoff rejected: not armed".into()));
                }
                sim.mode = FlightMode::Takeoff;
                sim.target = Target::Climb { to: altitude };
            }
            LinkCommand::Land => {
                sim.mode = FlightMode::Land;
                sim.target = Target::Descend;
            }
            LinkCommand::ReturnToLaunch => {
                sim.mode = FlightMode::ReturnToLaunch;
                sim.target = Target::Rtl { landing: false };
            }
            LinkCommand::Hold => {
                sim.mode = FlightMode::Hold;
                sim.vel = VectorNED::ZERO;
                sim.target = Target::Idle;
            }
            LinkCommand::GotoLocation { lat, lon, alt, yaw } => {
                sim.mode = FlightMode::Guided;
                if let Some(yaw) = yaw {
                    sim.heading = yaw;
                }
                sim.target = Target::Goto { lat, lon, alt };
            }
            LinkCommand::SetVelocityNed { velocity, yaw } => {
                sim.mode = FlightMode::Offboard;
                if let Some(yaw) = yaw {
                    sim.heading = yaw;
                }
                sim.target = Target::Velocity { v: velocity };
            }
            LinkCommand::SetMaximumSpeed { speed } => {
                sim.cruise_speed = speed;
            }
            LinkCommand::StartOrbit {
                lat,
                lon,
                radius,
                speed,
                clockwise,
            } => {
                let center = Coordinate::new(lat, lon, sim.pos.alt);
                let radial = center.vector_to(&sim.pos);
                let angle_rad = radial.east.atan2(radial.north);
                let start = VectorNED::new(angle_rad.cos(), angle_rad.sin(), 0.0);
                let mut pos = center.offset_by(start * radius);
                pos.alt = sim.pos.alt;
                sim.pos = pos;
                sim.mode = FlightMode::Guided;
                sim.target = Target::Orbit {
                    center,
                    radius,
                    speed,
                    clockwise,
                    angle_rad,
                };
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Link;

    #[tokio::test]
    async fn takeoff_ramps_altitude() {
        let mock = Arc::new(MockLink::accelerated(10.0));
        let link = Link::new(mock.clone());
        link.start().await.unwrap();
        link.send(LinkCommand::Arm).await.unwrap();
        link.send(LinkCommand::Takeoff { altitude: 10.0 }).await.unwrap();
        let snap = link
            .store()
            .wait_until(
                |s| s.altitude().unwrap_or(0.0) >= 9.5,
                Duration::from_secs(5),
            )
            .await
            .expect("should reach altitude");
        assert_eq!(snap.in_air, Some(true));
        link.shutdown().await;
    }

    #[tokio::test]
    async fn takeoff_requires_arming() {
        let mock = Arc::new(MockLink::new());
        let link = Link::new(mock.clone());
        link.start().await.unwrap();
        let err = link.send(LinkCommand::Takeoff { altitude: 10.0 }).await;
        assert!(err.is_err());
        link.shutdown().await;
    }

    #[tokio::test]
    async fn goto_moves_toward_target() {
        let mock = Arc::new(MockLink::accelerated(20.0));
        let link = Link::new(mock.clone());
        link.start().await.unwrap();
        link.send(LinkCommand::Arm).await.unwrap();
        let start = mock.position();
        let target = start.offset_by(VectorNED::new(60.0, 0.0, -10.0));
        link.send(LinkCommand::GotoLocation {
            lat: target.lat,
            lon: target.lon,
            alt: target.alt,
            yaw: None,
        })
        .await
        .unwrap();
        let snap = link
            .store()
            .wait_until(
                |s| {
                    s.position
                        .as_ref()
                        .map(|p| p.distance_to(&target) < 1.0)
                        .unwrap_or(false)
                },
                Duration::from_secs(5),
            )
            .await
            .expect("should arrive");
        assert!(snap.position.unwrap().distance_to(&target) < 1.0);
        link.shutdown().await;
    }
}
