use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use skyhook_geo::{wrap_heading, Coordinate, VectorNED, Waypoint};
use skyhook_link::{
    Endpoint, FlightMode, GpsInfo, LandedState, Link, LinkBackend, LinkCommand, LinkHealth,
    MavlinkLink, Snapshot, TelemetryStore, Watchdog,
};
use skyhook_safety::{
    clamp_speed, clamp_velocity, run_preflight_checks, validate_coordinate, validate_speed,
    validate_timeout, validate_tolerance, validate_velocity, Failsafe, SafetyCheckerClient,
    SafetyLimits, SafetyMonitor, SafetyViolationType, ValidationResult, VehicleType,
};

use crate::commands::{self, GotoPlan, OrbitPlan};
use crate::error::VehicleError;
use crate::events::{EventBus, VehicleEvent};
use crate::handle::{CommandHandle, CommandResult};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_GRACE: Duration = Duration::from_secs(2);
const ARM_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
const TAKEOFF_TIMEOUT: Duration = Duration::from_secs(60);
const LAND_TIMEOUT: Duration = Duration::from_secs(120);
const RTL_TIMEOUT: Duration = Duration::from_secs(300);
const HEADING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GOTO_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_GOTO_TOLERANCE_M: f64 = 2.0;
pub const DEFAULT_ALTITUDE_TOLERANCE_M: f64 = 0.5;

/// Battery view with the low/critical flags derived from the active limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub voltage: f64,
    pub current: f64,
    pub percentage: f64,
    pub is_low: bool,
    pub is_critical: bool,
}

#[derive(Debug, Clone)]
pub struct VehicleOptions {
    pub limits: SafetyLimits,
    pub vehicle_type: VehicleType,
    /// Address of an external geofence checker (`host:port`); commands are
    /// pre-validated against it when set.
    pub checker_addr: Option<String>,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for VehicleOptions {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            vehicle_type: VehicleType::Copter,
            checker_addr: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GotoOptions {
    pub tolerance: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timeout: Duration,
}

impl Default for GotoOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_GOTO_TOLERANCE_M,
            speed: None,
            heading: None,
            timeout: DEFAULT_GOTO_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetVelocityOptions {
    pub heading: Option<f64>,
    /// How long to hold the velocity. `None` streams until cancelled or
    /// superseded.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrbitOptions {
    pub speed: f64,
    pub clockwise: bool,
    pub revolutions: f64,
}

impl Default for OrbitOptions {
    fn default() -> Self {
        Self {
            speed: 5.0,
            clockwise: true,
            revolutions: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArmOptions {
    pub skip_preflight: bool,
    pub force: bool,
}

pub(crate) struct VehicleInner {
    pub(crate) link: Link,
    pub(crate) limits: SafetyLimits,
    pub(crate) vehicle_type: VehicleType,
    pub(crate) events: EventBus,
    pub(crate) abort_flag: AtomicBool,
    pub(crate) active: Mutex<Option<CommandHandle>>,
    locked_heading: Mutex<Option<f64>>,
    checker: Mutex<Option<Arc<SafetyCheckerClient>>>,
    checker_addr: Option<String>,
    monitor: Mutex<Option<Arc<SafetyMonitor>>>,
    health: Mutex<Option<watch::Receiver<LinkHealth>>>,
    connected: AtomicBool,
    connect_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl VehicleInner {
    pub(crate) fn link_alive(&self) -> bool {
        self.health
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.borrow().alive)
            .unwrap_or(true)
    }

    pub(crate) fn health_age(&self) -> Duration {
        self.health
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.borrow().last_frame_age)
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn clear_active(&self, handle: &CommandHandle) {
        let mut active = self.active.lock().unwrap();
        if active.as_ref().map(|h| h.same_as(handle)).unwrap_or(false) {
            *active = None;
        }
    }
}

/// High-level control surface for one vehicle on one link.
///
/// Cheap to clone; all clones share the same link, telemetry and command
/// arbitration. Every navigation operation returns a [`CommandHandle`];
/// awaiting the handle is the blocking form.
#[derive(Clone)]
pub struct Vehicle {
    inner: Arc<VehicleInner>,
}

impl Vehicle {
    pub fn new(backend: Arc<dyn LinkBackend>, options: VehicleOptions) -> Self {
        Self {
            inner: Arc::new(VehicleInner {
                link: Link::new(backend),
                limits: options.limits,
                vehicle_type: options.vehicle_type,
                events: EventBus::new(),
                abort_flag: AtomicBool::new(false),
                active: Mutex::new(None),
                locked_heading: Mutex::new(None),
                checker: Mutex::new(None),
                checker_addr: options.checker_addr,
                monitor: Mutex::new(None),
                health: Mutex::new(None),
                connected: AtomicBool::new(false),
                connect_timeout: options.connect_timeout,
                heartbeat_timeout: options.heartbeat_timeout,
            }),
        }
    }

    /// Open a MAVLink endpoint (`udp://…`, `tcp://…`, `serial://…`) and
    /// wrap it in a vehicle.
    pub fn for_endpoint(endpoint: &str, options: VehicleOptions) -> Result<Self, VehicleError> {
        let endpoint: Endpoint = endpoint
            .parse()
            .map_err(|e: skyhook_link::LinkError| VehicleError::Connection(e.to_string()))?;
        let backend =
            MavlinkLink::connect(&endpoint).map_err(|e| VehicleError::Connection(e.to_string()))?;
        Ok(Self::new(Arc::new(backend), options))
    }

    /// Start telemetry, wait for the first position fix, then bring up the
    /// heartbeat watchdog, the safety monitor, and (if configured) the
    /// geofence checker client.
    pub async fn connect(&self) -> Result<(), VehicleError> {
        self.inner
            .link
            .start()
            .await
            .map_err(|e| VehicleError::Connection(e.to_string()))?;

        let store = self.inner.link.store().clone();
        store
            .wait_until(|s| s.position.is_some(), self.inner.connect_timeout)
            .await
            .map_err(|_| VehicleError::ConnectionTimeout {
                timeout: self.inner.connect_timeout,
            })?;

        let health = Watchdog::spawn(store.clone(), self.inner.heartbeat_timeout, WATCHDOG_GRACE);
        *self.inner.health.lock().unwrap() = Some(health);

        let monitor = SafetyMonitor::new(self.inner.limits.clone(), store);
        monitor.set_failsafe(Arc::new(self.clone()));
        for kind in [
            SafetyViolationType::BatteryLow,
            SafetyViolationType::BatteryCritical,
            SafetyViolationType::SpeedTooHigh,
            SafetyViolationType::VerticalSpeedTooHigh,
            SafetyViolationType::GpsPoor,
        ] {
            let events = self.inner.events.clone();
            monitor.on_violation(kind, move |violation| {
                events.emit(VehicleEvent::SafetyViolation {
                    kind: violation.kind,
                    message: violation.message.clone(),
                });
            });
        }
        let _ = monitor.clone().start();
        *self.inner.monitor.lock().unwrap() = Some(monitor);

        if let Some(addr) = &self.inner.checker_addr {
            let client = SafetyCheckerClient::connect(addr.clone())
                .await
                .map_err(|e| VehicleError::GeofenceUnavailable(e.to_string()))?;
            *self.inner.checker.lock().unwrap() = Some(Arc::new(client));
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.events.emit(VehicleEvent::Connected);
        info!(vehicle_type = ?self.inner.vehicle_type, "vehicle connected");
        Ok(())
    }

    /// Cancel any active command, stop the background tasks and close the
    /// link.
    pub async fn disconnect(&self) {
        let active = self.inner.active.lock().unwrap().clone();
        if let Some(handle) = active {
            handle.cancel(false).await;
        }
        if let Some(monitor) = self.inner.monitor.lock().unwrap().take() {
            monitor.stop();
        }
        self.inner.link.shutdown().await;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.events.emit(VehicleEvent::Disconnected);
        info!("vehicle disconnected");
    }

    // Telemetry accessors. Unpopulated fields surface UnavailableTelemetry.

    pub fn snapshot(&self) -> Snapshot {
        self.inner.link.store().snapshot()
    }

    pub fn store(&self) -> &TelemetryStore {
        self.inner.link.store()
    }

    pub fn events(&self) -> broadcast::Receiver<VehicleEvent> {
        self.inner.events.subscribe()
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.inner.limits
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.inner.vehicle_type
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn safety_monitor(&self) -> Option<Arc<SafetyMonitor>> {
        self.inner.monitor.lock().unwrap().clone()
    }

    pub fn active_command(&self) -> Option<CommandHandle> {
        self.inner.active.lock().unwrap().clone()
    }

    pub fn position(&self) -> Result<Coordinate, VehicleError> {
        self.snapshot()
            .position
            .ok_or(VehicleError::UnavailableTelemetry("position"))
    }

    pub fn altitude(&self) -> Result<f64, VehicleError> {
        self.snapshot()
            .altitude()
            .ok_or(VehicleError::UnavailableTelemetry("altitude"))
    }

    pub fn heading(&self) -> Result<f64, VehicleError> {
        self.snapshot()
            .heading
            .ok_or(VehicleError::UnavailableTelemetry("heading"))
    }

    pub fn velocity(&self) -> Result<VectorNED, VehicleError> {
        self.snapshot()
            .velocity
            .ok_or(VehicleError::UnavailableTelemetry("velocity"))
    }

    pub fn groundspeed(&self) -> Result<f64, VehicleError> {
        self.snapshot()
            .groundspeed
            .ok_or(VehicleError::UnavailableTelemetry("groundspeed"))
    }

    pub fn airspeed(&self) -> Result<f64, VehicleError> {
        self.snapshot()
            .airspeed
            .ok_or(VehicleError::UnavailableTelemetry("airspeed"))
    }

    pub fn climb_rate(&self) -> Result<f64, VehicleError> {
        self.snapshot()
            .climb_rate
            .ok_or(VehicleError::UnavailableTelemetry("climb_rate"))
    }

    pub fn battery(&self) -> Result<BatteryStatus, VehicleError> {
        let battery = self
            .snapshot()
            .battery
            .ok_or(VehicleError::UnavailableTelemetry("battery"))?;
        Ok(BatteryStatus {
            voltage: battery.voltage,
            current: battery.current,
            percentage: battery.percentage,
            is_low: battery.percentage < self.inner.limits.min_battery_percent,
            is_critical: battery.percentage < self.inner.limits.critical_battery_percent,
        })
    }

    pub fn gps(&self) -> Result<GpsInfo, VehicleError> {
        self.snapshot()
            .gps
            .ok_or(VehicleError::UnavailableTelemetry("gps"))
    }

    pub fn home(&self) -> Result<Coordinate, VehicleError> {
        self.snapshot()
            .home
            .ok_or(VehicleError::UnavailableTelemetry("home"))
    }

    pub fn armed(&self) -> bool {
        self.snapshot().armed.unwrap_or(false)
    }

    pub fn in_air(&self) -> bool {
        self.snapshot().in_air.unwrap_or(false)
    }

    pub fn landed_state(&self) -> LandedState {
        self.snapshot().landed_state.unwrap_or(LandedState::Unknown)
    }

    pub fn flight_mode(&self) -> FlightMode {
        self.snapshot().flight_mode.unwrap_or(FlightMode::Unknown)
    }

    // Arming.

    pub async fn arm(&self) -> Result<(), VehicleError> {
        self.arm_with(ArmOptions::default()).await
    }

    /// Run preflight checks (unless skipped or forced) and arm. No arm
    /// command goes out when the checks fail.
    pub async fn arm_with(&self, options: ArmOptions) -> Result<(), VehicleError> {
        self.ensure_not_aborted()?;
        if self.inner.limits.enable_preflight_checks && !options.skip_preflight && !options.force {
            let result = run_preflight_checks(
                &self.snapshot(),
                &self.inner.limits,
                self.inner.link_alive(),
            );
            for warning in &result.warnings {
                warn!("preflight: {warning}");
            }
            if !result.ok() {
                return Err(VehicleError::PreflightCheckFailed { result });
            }
        }
        self.inner
            .link
            .send(LinkCommand::Arm)
            .await
            .map_err(|e| VehicleError::Arm(e.to_string()))?;
        self.inner
            .link
            .store()
            .wait_until(|s| s.armed == Some(true), ARM_CONFIRM_TIMEOUT)
            .await
            .map_err(|_| VehicleError::Arm("arm not confirmed by vehicle".to_string()))?;
        self.inner.events.emit(VehicleEvent::Armed);
        info!("armed");
        Ok(())
    }

    pub async fn disarm(&self) -> Result<(), VehicleError> {
        self.disarm_with(false).await
    }

    pub async fn disarm_with(&self, force: bool) -> Result<(), VehicleError> {
        self.inner
            .link
            .send(LinkCommand::Disarm { force })
            .await
            .map_err(|e| VehicleError::Arm(e.to_string()))?;
        self.inner
            .link
            .store()
            .wait_until(|s| s.armed == Some(false), ARM_CONFIRM_TIMEOUT)
            .await
            .map_err(|_| VehicleError::Arm("disarm not confirmed by vehicle".to_string()))?;
        self.inner.events.emit(VehicleEvent::Disarmed);
        info!("disarmed");
        Ok(())
    }

    // Navigation commands.

    /// Climb to `altitude` meters above home. Completes when the vehicle
    /// reports in-air at the target altitude (within 0.5 m).
    pub async fn takeoff(&self, altitude: f64) -> Result<CommandHandle, VehicleError> {
        if self.inner.vehicle_type == VehicleType::Rover {
            return Err(VehicleError::Navigation {
                reason: "takeoff is not available on rovers".to_string(),
            });
        }
        let altitude = self.resolve_altitude(altitude)?;
        self.geofence_check_takeoff(altitude).await?;
        self.ensure_not_aborted()?;
        if !self.armed() {
            return Err(VehicleError::Takeoff("vehicle is not armed".to_string()));
        }
        let handle = self.begin_command("takeoff", Some(TAKEOFF_TIMEOUT), false, false)?;
        tokio::spawn(commands::drive_takeoff(
            self.inner.clone(),
            handle.clone(),
            altitude,
        ));
        Ok(handle)
    }

    /// Land at the current position. Completes on ground and disarmed.
    /// Supersedes whatever command is active.
    pub async fn land(&self) -> Result<CommandHandle, VehicleError> {
        if self.inner.vehicle_type == VehicleType::Rover {
            return Err(VehicleError::Navigation {
                reason: "land is not available on rovers".to_string(),
            });
        }
        let handle = self.begin_command("land", Some(LAND_TIMEOUT), false, true)?;
        tokio::spawn(commands::drive_land(self.inner.clone(), handle.clone()));
        Ok(handle)
    }

    /// Return to the home position and land. Supersedes the active
    /// command.
    pub async fn rtl(&self) -> Result<CommandHandle, VehicleError> {
        let handle = self.begin_command("rtl", Some(RTL_TIMEOUT), false, true)?;
        tokio::spawn(commands::drive_rtl(self.inner.clone(), handle.clone()));
        Ok(handle)
    }

    /// Stop and hold the current position. Supersedes the active command.
    pub async fn hold(&self) -> Result<CommandHandle, VehicleError> {
        let handle = self.begin_command("hold", None, false, true)?;
        tokio::spawn(commands::drive_one_shot(
            self.inner.clone(),
            handle.clone(),
            LinkCommand::Hold,
        ));
        Ok(handle)
    }

    /// Fly to a coordinate. Completes when within `options.tolerance`
    /// meters (ground distance for rovers).
    pub async fn goto(
        &self,
        target: Coordinate,
        options: GotoOptions,
    ) -> Result<CommandHandle, VehicleError> {
        self.goto_named("goto", target, options).await
    }

    pub async fn goto_latlon(
        &self,
        lat: f64,
        lon: f64,
        alt: f64,
        options: GotoOptions,
    ) -> Result<CommandHandle, VehicleError> {
        self.goto(Coordinate::new(lat, lon, alt), options).await
    }

    async fn goto_named(
        &self,
        name: &'static str,
        mut target: Coordinate,
        options: GotoOptions,
    ) -> Result<CommandHandle, VehicleError> {
        self.checked(validate_coordinate(&target))?;
        self.checked(validate_tolerance(options.tolerance))?;
        self.checked(validate_timeout(options.timeout))?;
        let rover = self.inner.vehicle_type == VehicleType::Rover;
        if rover {
            target.alt = 0.0;
        } else {
            target.alt = self.resolve_altitude(target.alt)?;
        }
        let speed = match options.speed {
            Some(speed) => Some(self.resolve_speed(speed)?),
            None => None,
        };
        self.geofence_check_waypoint(&target).await?;
        if let Some(speed) = speed {
            self.geofence_check_speed(speed).await?;
        }
        self.ensure_not_aborted()?;
        let heading = options
            .heading
            .map(wrap_heading)
            .or(*self.inner.locked_heading.lock().unwrap());
        let handle = self.begin_command(name, Some(options.timeout), false, false)?;
        tokio::spawn(commands::drive_goto(
            self.inner.clone(),
            handle.clone(),
            GotoPlan {
                target,
                tolerance: options.tolerance,
                speed,
                heading,
                rover,
            },
        ));
        Ok(handle)
    }

    /// Change altitude in place.
    pub async fn set_altitude(&self, altitude: f64) -> Result<CommandHandle, VehicleError> {
        self.set_altitude_with(altitude, DEFAULT_ALTITUDE_TOLERANCE_M)
            .await
    }

    pub async fn set_altitude_with(
        &self,
        altitude: f64,
        tolerance: f64,
    ) -> Result<CommandHandle, VehicleError> {
        let position = self.position()?;
        self.goto_named(
            "set_altitude",
            Coordinate::new(position.lat, position.lon, altitude),
            GotoOptions {
                tolerance,
                ..GotoOptions::default()
            },
        )
        .await
    }

    /// Turn to a compass heading. Completes when the signed shortest
    /// difference is within 2 degrees. The heading stays locked for
    /// subsequent gotos until [`clear_heading`](Self::clear_heading).
    pub async fn set_heading(&self, heading: f64) -> Result<CommandHandle, VehicleError> {
        if !heading.is_finite() {
            return Err(VehicleError::ParameterValidation {
                parameter: "heading".to_string(),
                message: format!("heading must be finite, got {heading}"),
                value: None,
                limit: None,
            });
        }
        self.ensure_not_aborted()?;
        let heading = wrap_heading(heading);
        *self.inner.locked_heading.lock().unwrap() = Some(heading);
        let handle = self.begin_command("set_heading", Some(HEADING_TIMEOUT), false, false)?;
        tokio::spawn(commands::drive_set_heading(
            self.inner.clone(),
            handle.clone(),
            heading,
        ));
        Ok(handle)
    }

    /// Forget the heading locked by `set_heading`/`point_at`; gotos face
    /// their target again.
    pub fn clear_heading(&self) {
        *self.inner.locked_heading.lock().unwrap() = None;
    }

    /// Turn toward a target coordinate.
    pub async fn point_at(&self, target: &Coordinate) -> Result<CommandHandle, VehicleError> {
        let bearing = self.position()?.bearing_to(target);
        self.set_heading(bearing).await
    }

    /// Stream an offboard NED velocity setpoint. With a duration the
    /// command completes after that long; without one it runs until
    /// cancelled or superseded by any subsequent command.
    pub async fn set_velocity(
        &self,
        velocity: VectorNED,
        options: SetVelocityOptions,
    ) -> Result<CommandHandle, VehicleError> {
        let velocity = self.resolve_velocity(velocity)?;
        let horizontal = velocity.magnitude(true);
        if horizontal > 0.0 {
            self.geofence_check_speed(horizontal).await?;
        }
        self.ensure_not_aborted()?;
        let continuous = options.duration.is_none();
        let timeout = options
            .duration
            .map(|d| d + Duration::from_secs(10));
        let handle = self.begin_command("set_velocity", timeout, continuous, false)?;
        tokio::spawn(commands::drive_set_velocity(
            self.inner.clone(),
            handle.clone(),
            velocity,
            options.heading.map(wrap_heading),
            options.duration,
        ));
        Ok(handle)
    }

    /// Set the autopilot's cruise groundspeed.
    pub async fn set_groundspeed(&self, speed: f64) -> Result<(), VehicleError> {
        let speed = self.resolve_speed(speed)?;
        self.geofence_check_speed(speed).await?;
        self.inner
            .link
            .send(LinkCommand::SetMaximumSpeed { speed })
            .await?;
        Ok(())
    }

    /// Circle `center` at `radius` meters. Completes after the configured
    /// number of revolutions of angular travel around the center.
    pub async fn orbit(
        &self,
        center: Coordinate,
        radius: f64,
        options: OrbitOptions,
    ) -> Result<CommandHandle, VehicleError> {
        self.checked(validate_coordinate(&center))?;
        if !(radius.is_finite() && radius >= 1.0) {
            return Err(VehicleError::ParameterValidation {
                parameter: "radius".to_string(),
                message: format!("orbit radius must be at least 1m, got {radius}"),
                value: Some(radius),
                limit: Some(1.0),
            });
        }
        if !(options.revolutions.is_finite() && options.revolutions > 0.0) {
            return Err(VehicleError::ParameterValidation {
                parameter: "revolutions".to_string(),
                message: format!("revolutions must be positive, got {}", options.revolutions),
                value: Some(options.revolutions),
                limit: None,
            });
        }
        let speed = self.resolve_speed(options.speed)?;
        self.geofence_check_waypoint(&center).await?;
        self.ensure_not_aborted()?;

        let expected = 2.0 * std::f64::consts::PI * radius * options.revolutions / speed;
        let timeout = Duration::from_secs_f64(expected * 1.5) + Duration::from_secs(30);
        let handle = self.begin_command("orbit", Some(timeout), false, false)?;
        tokio::spawn(commands::drive_orbit(
            self.inner.clone(),
            handle.clone(),
            OrbitPlan {
                center,
                radius,
                speed,
                clockwise: options.clockwise,
                revolutions: options.revolutions,
            },
        ));
        Ok(handle)
    }

    /// Move `distance` meters along a compass bearing at the current
    /// altitude.
    pub async fn move_in_direction(
        &self,
        bearing: f64,
        distance: f64,
    ) -> Result<CommandHandle, VehicleError> {
        if !(distance.is_finite() && distance > 0.0) {
            return Err(VehicleError::ParameterValidation {
                parameter: "distance".to_string(),
                message: format!("distance must be positive, got {distance}"),
                value: Some(distance),
                limit: None,
            });
        }
        let position = self.position()?;
        let rad = wrap_heading(bearing).to_radians();
        let target = position.offset_by(VectorNED::new(
            distance * rad.cos(),
            distance * rad.sin(),
            0.0,
        ));
        self.goto(target, GotoOptions::default()).await
    }

    /// Move `distance` meters along the current heading.
    pub async fn move_in_current_direction(
        &self,
        distance: f64,
    ) -> Result<CommandHandle, VehicleError> {
        let heading = self.heading()?;
        self.move_in_direction(heading, distance).await
    }

    /// Step `distance` meters toward a target.
    pub async fn move_towards(
        &self,
        target: &Coordinate,
        distance: f64,
    ) -> Result<CommandHandle, VehicleError> {
        let bearing = self.position()?.bearing_to(target);
        self.move_in_direction(bearing, distance).await
    }

    /// Fly a waypoint: apply its speed, goto within its acceptance radius,
    /// then loiter for its hold time.
    pub async fn fly_waypoint(&self, waypoint: &Waypoint) -> Result<CommandResult, VehicleError> {
        let handle = self
            .goto(
                waypoint.coordinate.clone(),
                GotoOptions {
                    tolerance: waypoint.acceptance_radius,
                    speed: waypoint.speed,
                    ..GotoOptions::default()
                },
            )
            .await?;
        let result = handle.result().await;
        result.require_success()?;
        if !waypoint.hold_time.is_zero() {
            tokio::time::sleep(waypoint.hold_time).await;
        }
        Ok(result)
    }

    // Abort handling.

    /// Raise the abort flag, cancel the active command, and bring the
    /// vehicle back (`rtl = true`) or freeze it in place. Further
    /// navigation commands fail fast until [`reset_abort`](Self::reset_abort).
    pub async fn abort(&self, rtl: bool) -> Result<CommandHandle, VehicleError> {
        if !self.inner.abort_flag.swap(true, Ordering::SeqCst) {
            warn!("abort triggered");
            self.inner.events.emit(VehicleEvent::AbortTriggered);
        }
        let active = self.inner.active.lock().unwrap().clone();
        if let Some(handle) = active {
            handle.request_cancel(false);
        }
        if rtl {
            self.rtl().await
        } else {
            self.hold().await
        }
    }

    pub fn reset_abort(&self) {
        self.inner.abort_flag.store(false, Ordering::SeqCst);
        info!("abort flag cleared");
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.abort_flag.load(Ordering::SeqCst)
    }

    // Internals.

    fn ensure_not_aborted(&self) -> Result<(), VehicleError> {
        if self.is_aborted() {
            Err(VehicleError::Abort {
                reason: "abort flag is set".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn checked(&self, result: ValidationResult) -> Result<(), VehicleError> {
        if result.ok {
            Ok(())
        } else {
            Err(VehicleError::from_validation(result))
        }
    }

    fn resolve_speed(&self, speed: f64) -> Result<f64, VehicleError> {
        let result = validate_speed(speed, &self.inner.limits);
        if result.ok {
            Ok(speed)
        } else if self.inner.limits.auto_clamp_values && speed.is_finite() && speed > 0.0 {
            let clamped = clamp_speed(speed, &self.inner.limits);
            debug!(requested = speed, clamped, "speed clamped to limit");
            Ok(clamped)
        } else {
            Err(VehicleError::from_validation(result))
        }
    }

    fn resolve_altitude(&self, altitude: f64) -> Result<f64, VehicleError> {
        let limits = &self.inner.limits;
        let result = skyhook_safety::validate_altitude(altitude, limits);
        if result.ok {
            Ok(altitude)
        } else if limits.auto_clamp_values && altitude.is_finite() {
            let clamped = altitude.clamp(limits.min_altitude, limits.max_altitude);
            debug!(requested = altitude, clamped, "altitude clamped to limits");
            Ok(clamped)
        } else {
            Err(VehicleError::from_validation(result))
        }
    }

    fn resolve_velocity(&self, velocity: VectorNED) -> Result<VectorNED, VehicleError> {
        let result = validate_velocity(&velocity, &self.inner.limits);
        if result.ok {
            Ok(velocity)
        } else if self.inner.limits.auto_clamp_values
            && velocity.north.is_finite()
            && velocity.east.is_finite()
            && velocity.down.is_finite()
        {
            let clamped = clamp_velocity(&velocity, &self.inner.limits);
            debug!(?velocity, ?clamped, "velocity clamped to limits");
            Ok(clamped)
        } else {
            Err(VehicleError::from_validation(result))
        }
    }

    fn checker(&self) -> Option<Arc<SafetyCheckerClient>> {
        self.inner.checker.lock().unwrap().clone()
    }

    async fn geofence_check_waypoint(&self, target: &Coordinate) -> Result<(), VehicleError> {
        let Some(checker) = self.checker() else {
            return Ok(());
        };
        let from = self.position()?;
        match checker.validate_waypoint(&from, target).await {
            Ok(verdict) if verdict.valid => Ok(()),
            Ok(verdict) => Err(VehicleError::GeofenceViolation {
                current_position: Some(from),
                target_position: Some(target.clone()),
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "waypoint rejected".to_string()),
            }),
            Err(e) => Err(VehicleError::GeofenceUnavailable(e.to_string())),
        }
    }

    async fn geofence_check_speed(&self, speed: f64) -> Result<(), VehicleError> {
        let Some(checker) = self.checker() else {
            return Ok(());
        };
        match checker.validate_speed(speed).await {
            Ok(verdict) if verdict.valid => Ok(()),
            Ok(verdict) => Err(VehicleError::GeofenceViolation {
                current_position: self.position().ok(),
                target_position: None,
                reason: verdict
                    .reason
                    .unwrap_or_else(|| format!("speed {speed} m/s rejected")),
            }),
            Err(e) => Err(VehicleError::GeofenceUnavailable(e.to_string())),
        }
    }

    async fn geofence_check_takeoff(&self, altitude: f64) -> Result<(), VehicleError> {
        let Some(checker) = self.checker() else {
            return Ok(());
        };
        let position = self.position()?;
        match checker
            .validate_takeoff(position.lat, position.lon, altitude)
            .await
        {
            Ok(verdict) if verdict.valid => Ok(()),
            Ok(verdict) => Err(VehicleError::GeofenceViolation {
                current_position: Some(position.clone()),
                target_position: Some(Coordinate::new(position.lat, position.lon, altitude)),
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "takeoff rejected".to_string()),
            }),
            Err(e) => Err(VehicleError::GeofenceUnavailable(e.to_string())),
        }
    }

    /// Arbitration: navigation commands are rejected while another command
    /// runs; recovery commands (`land`, `rtl`, `hold`, `abort`) and any
    /// command following a continuous `set_velocity` supersede it instead.
    fn begin_command(
        &self,
        name: &'static str,
        timeout: Option<Duration>,
        continuous: bool,
        supersede: bool,
    ) -> Result<CommandHandle, VehicleError> {
        let mut active = self.inner.active.lock().unwrap();
        if let Some(current) = active.as_ref() {
            if !current.is_complete() {
                if supersede || current.is_continuous() {
                    debug!(superseded = current.command(), by = name, "superseding active command");
                    current.request_cancel(false);
                } else {
                    return Err(VehicleError::CommandBusy {
                        active: current.command(),
                    });
                }
            }
        }
        let handle = CommandHandle::new(name, timeout, continuous);
        *active = Some(handle.clone());
        drop(active);
        self.inner
            .events
            .emit(VehicleEvent::CommandStarted { command: name });
        debug!(command = name, "command started");
        Ok(handle)
    }
}

/// Battery-critical failsafe: the monitor calls back into the vehicle's
/// own RTL.
#[async_trait]
impl Failsafe for Vehicle {
    async fn return_to_launch(&self) {
        match self.rtl().await {
            Ok(_) => {}
            Err(e) => warn!("failsafe RTL could not start: {e}"),
        }
    }
}
