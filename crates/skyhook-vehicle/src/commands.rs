use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use skyhook_geo::{heading_difference, Coordinate, VectorNED};
use skyhook_link::{LandedState, LinkCommand, Snapshot};

use crate::error::VehicleError;
use crate::events::VehicleEvent;
use crate::handle::{CommandHandle, CommandStatus};
use crate::vehicle::VehicleInner;

/// Driver poll interval. Bounds progress-update latency (well above the
/// 2 Hz contract) and cancellation latency (well below one monitor cycle).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct GotoPlan {
    pub target: Coordinate,
    pub tolerance: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub rover: bool,
}

pub(crate) struct OrbitPlan {
    pub center: Coordinate,
    pub radius: f64,
    pub speed: f64,
    pub clockwise: bool,
    pub revolutions: f64,
}

enum Tick {
    Continue,
    Send(LinkCommand),
    Complete,
}

/// Shared driver engine.
///
/// Sends the initial wire commands, then polls telemetry until the
/// command-specific tick reports completion, honoring (in order) abort,
/// cancellation, link loss and the deadline. Exactly one terminal
/// transition happens here; the active slot is released afterwards.
///
/// Recovery commands (`hold`, `land`, `rtl`) run with `honor_abort` off:
/// they are how an abort is executed, so the abort flag must not cancel
/// them.
async fn drive<FT, FE>(
    inner: Arc<VehicleInner>,
    handle: CommandHandle,
    initial: Vec<LinkCommand>,
    honor_abort: bool,
    hold_on_cancel: bool,
    hold_on_timeout: bool,
    on_timeout: FE,
    mut tick: FT,
) where
    FT: FnMut(&Snapshot, &CommandHandle) -> Tick + Send,
    FE: FnOnce(&Snapshot) -> VehicleError + Send,
{
    handle.mark_running();
    let mut rx = inner.link.store().subscribe();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'outer: {
        for cmd in initial {
            if let Err(e) = inner.link.send(cmd).await {
                handle.finish(CommandStatus::Failed, Some(e.into()));
                break 'outer;
            }
        }

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        handle.finish(
                            CommandStatus::Failed,
                            Some(VehicleError::Link("telemetry store closed".to_string())),
                        );
                        break 'outer;
                    }
                }
                _ = interval.tick() => {}
            }
            let snapshot = rx.borrow_and_update().clone();

            if honor_abort && inner.abort_flag.load(Ordering::SeqCst) {
                handle.finish(
                    CommandStatus::Cancelled,
                    Some(VehicleError::Abort {
                        reason: "abort".to_string(),
                    }),
                );
                break 'outer;
            }

            if handle.cancel_requested() {
                let error = if hold_on_cancel && handle.cancel_action_requested() {
                    inner
                        .link
                        .send(LinkCommand::Hold)
                        .await
                        .err()
                        .map(VehicleError::from)
                } else {
                    None
                };
                handle.finish(CommandStatus::Cancelled, error);
                break 'outer;
            }

            if !inner.link_alive() {
                handle.finish(
                    CommandStatus::Failed,
                    Some(VehicleError::HeartbeatLost {
                        age: inner.health_age(),
                    }),
                );
                break 'outer;
            }

            if handle.deadline_exceeded() {
                if hold_on_timeout {
                    // Freeze in place; the mission decides what happens next.
                    let _ = inner.link.send(LinkCommand::Hold).await;
                }
                handle.finish(CommandStatus::TimedOut, Some(on_timeout(&snapshot)));
                break 'outer;
            }

            match tick(&snapshot, &handle) {
                Tick::Continue => {}
                Tick::Send(cmd) => {
                    if let Err(e) = inner.link.send(cmd).await {
                        handle.finish(CommandStatus::Failed, Some(e.into()));
                        break 'outer;
                    }
                }
                Tick::Complete => {
                    handle.finish(CommandStatus::Completed, None);
                    break 'outer;
                }
            }
        }
    }

    inner.clear_active(&handle);
    let status = handle.status();
    debug!(command = handle.command(), ?status, "command finished");
    inner.events.emit(VehicleEvent::CommandFinished {
        command: handle.command(),
        status,
    });
}

pub(crate) async fn drive_one_shot(
    inner: Arc<VehicleInner>,
    handle: CommandHandle,
    cmd: LinkCommand,
) {
    let name = handle.command();
    drive(
        inner,
        handle,
        vec![cmd],
        false,
        false,
        false,
        move |_| VehicleError::CommandTimeout {
            command: name,
            timeout: Duration::ZERO,
        },
        |_, _| Tick::Complete,
    )
    .await;
}

pub(crate) async fn drive_takeoff(
    inner: Arc<VehicleInner>,
    handle: CommandHandle,
    target_altitude: f64,
) {
    drive(
        inner,
        handle,
        vec![LinkCommand::Takeoff {
            altitude: target_altitude,
        }],
        true,
        true,
        true,
        move |snap: &Snapshot| VehicleError::TakeoffTimeout {
            target_altitude,
            current_altitude: snap.altitude().unwrap_or(0.0),
        },
        move |snap, handle| {
            let altitude = snap.altitude().unwrap_or(0.0);
            handle.set_progress([
                ("current_altitude", Value::from(altitude)),
                ("target_altitude", Value::from(target_altitude)),
                (
                    "altitude_remaining",
                    Value::from((target_altitude - altitude).max(0.0)),
                ),
            ]);
            if snap.in_air == Some(true) && altitude >= target_altitude - 0.5 {
                Tick::Complete
            } else {
                Tick::Continue
            }
        },
    )
    .await;
}

pub(crate) async fn drive_land(inner: Arc<VehicleInner>, handle: CommandHandle) {
    drive(
        inner,
        handle,
        vec![LinkCommand::Land],
        false,
        true,
        false,
        |snap: &Snapshot| VehicleError::LandingTimeout {
            current_altitude: snap.altitude().unwrap_or(0.0),
        },
        |snap, handle| {
            handle.set_progress([
                ("current_altitude", Value::from(snap.altitude().unwrap_or(0.0))),
                ("landed_state", landed_value(snap)),
                ("armed", Value::from(snap.armed.unwrap_or(false))),
            ]);
            if snap.landed_state == Some(LandedState::OnGround) && snap.armed == Some(false) {
                Tick::Complete
            } else {
                Tick::Continue
            }
        },
    )
    .await;
}

pub(crate) async fn drive_rtl(inner: Arc<VehicleInner>, handle: CommandHandle) {
    let timeout = handle.timeout().unwrap_or(Duration::ZERO);
    drive(
        inner,
        handle,
        vec![LinkCommand::ReturnToLaunch],
        false,
        true,
        false,
        move |_: &Snapshot| VehicleError::CommandTimeout {
            command: "rtl",
            timeout,
        },
        |snap, handle| {
            let distance_home = snap.distance_to_home();
            handle.set_progress([
                (
                    "distance_to_home",
                    distance_home.map(Value::from).unwrap_or(Value::Null),
                ),
                ("current_altitude", Value::from(snap.altitude().unwrap_or(0.0))),
                ("landed_state", landed_value(snap)),
            ]);
            let home_reached = distance_home.map(|d| d <= 2.0).unwrap_or(false);
            if home_reached && snap.landed_state == Some(LandedState::OnGround) {
                Tick::Complete
            } else {
                Tick::Continue
            }
        },
    )
    .await;
}

pub(crate) async fn drive_goto(inner: Arc<VehicleInner>, handle: CommandHandle, plan: GotoPlan) {
    let mut initial = Vec::new();
    if let Some(speed) = plan.speed {
        initial.push(LinkCommand::SetMaximumSpeed { speed });
    }
    initial.push(LinkCommand::GotoLocation {
        lat: plan.target.lat,
        lon: plan.target.lon,
        alt: plan.target.alt,
        yaw: plan.heading,
    });

    let target = plan.target.clone();
    let target_json = serde_json::to_value(&target).unwrap_or(Value::Null);
    let rover = plan.rover;
    let tolerance = plan.tolerance;
    let distance_to = move |snap: &Snapshot| -> Option<f64> {
        snap.position.as_ref().map(|pos| {
            if rover {
                pos.ground_distance_to(&target)
            } else {
                pos.distance_to(&target)
            }
        })
    };
    let timeout_distance = distance_to.clone();

    drive(
        inner,
        handle,
        initial,
        true,
        true,
        true,
        move |snap: &Snapshot| VehicleError::GotoTimeout {
            distance_remaining: timeout_distance(snap).unwrap_or(f64::NAN),
        },
        move |snap, handle| {
            let Some(distance) = distance_to(snap) else {
                return Tick::Continue;
            };
            handle.set_progress([
                ("distance", Value::from(distance)),
                ("target", target_json.clone()),
                ("tolerance", Value::from(tolerance)),
            ]);
            if distance <= tolerance {
                Tick::Complete
            } else {
                Tick::Continue
            }
        },
    )
    .await;
}

pub(crate) async fn drive_set_heading(
    inner: Arc<VehicleInner>,
    handle: CommandHandle,
    target_heading: f64,
) {
    let timeout = handle.timeout().unwrap_or(Duration::ZERO);
    let mut held = false;
    drive(
        inner,
        handle,
        Vec::new(),
        true,
        true,
        true,
        move |_: &Snapshot| VehicleError::CommandTimeout {
            command: "set_heading",
            timeout,
        },
        move |snap, handle| {
            let Some(current) = snap.heading else {
                return Tick::Continue;
            };
            let diff = heading_difference(current, target_heading);
            handle.set_progress([
                ("current_heading", Value::from(current)),
                ("target_heading", Value::from(target_heading)),
                ("heading_diff", Value::from(diff)),
            ]);
            if diff.abs() <= 2.0 {
                if held {
                    Tick::Complete
                } else {
                    held = true;
                    Tick::Send(LinkCommand::Hold)
                }
            } else {
                // Zero-velocity offboard setpoint with the target yaw.
                Tick::Send(LinkCommand::SetVelocityNed {
                    velocity: VectorNED::ZERO,
                    yaw: Some(target_heading),
                })
            }
        },
    )
    .await;
}

pub(crate) async fn drive_set_velocity(
    inner: Arc<VehicleInner>,
    handle: CommandHandle,
    velocity: VectorNED,
    yaw: Option<f64>,
    duration: Option<Duration>,
) {
    let started = Instant::now();
    let timeout = handle.timeout().unwrap_or(Duration::ZERO);
    let mut held = false;
    drive(
        inner,
        handle,
        Vec::new(),
        true,
        true,
        true,
        move |_: &Snapshot| VehicleError::CommandTimeout {
            command: "set_velocity",
            timeout,
        },
        move |_, handle| {
            let elapsed = started.elapsed();
            handle.set_progress([
                ("elapsed", Value::from(elapsed.as_secs_f64())),
                (
                    "duration",
                    duration
                        .map(|d| Value::from(d.as_secs_f64()))
                        .unwrap_or(Value::Null),
                ),
                (
                    "time_remaining",
                    duration
                        .map(|d| Value::from(d.saturating_sub(elapsed).as_secs_f64()))
                        .unwrap_or(Value::Null),
                ),
            ]);
            if let Some(duration) = duration {
                if elapsed >= duration {
                    // Stop moving before declaring the command done.
                    return if held {
                        Tick::Complete
                    } else {
                        held = true;
                        Tick::Send(LinkCommand::Hold)
                    };
                }
            }
            // Offboard setpoints must be restreamed continuously.
            Tick::Send(LinkCommand::SetVelocityNed { velocity, yaw })
        },
    )
    .await;
}

pub(crate) async fn drive_orbit(inner: Arc<VehicleInner>, handle: CommandHandle, plan: OrbitPlan) {
    let timeout = handle.timeout().unwrap_or(Duration::ZERO);
    let initial = vec![LinkCommand::StartOrbit {
        lat: plan.center.lat,
        lon: plan.center.lon,
        radius: plan.radius,
        speed: plan.speed,
        clockwise: plan.clockwise,
    }];

    let center = plan.center.clone();
    let target_revolutions = plan.revolutions;
    let mut previous_bearing: Option<f64> = None;
    let mut accumulated_deg = 0.0f64;
    let mut held = false;

    drive(
        inner,
        handle,
        initial,
        true,
        true,
        true,
        move |_: &Snapshot| VehicleError::CommandTimeout {
            command: "orbit",
            timeout,
        },
        move |snap, handle| {
            let Some(position) = &snap.position else {
                return Tick::Continue;
            };
            // Sign-preserving unwrap of the bearing from the orbit center;
            // total angular travel is what counts as a revolution.
            let bearing = center.bearing_to(position);
            if let Some(previous) = previous_bearing {
                accumulated_deg += heading_difference(previous, bearing);
            }
            previous_bearing = Some(bearing);
            let revolutions = accumulated_deg.abs() / 360.0;
            handle.set_progress([
                ("revolutions_completed", Value::from(revolutions)),
                ("target_revolutions", Value::from(target_revolutions)),
                (
                    "progress_percent",
                    Value::from((revolutions / target_revolutions * 100.0).min(100.0)),
                ),
                (
                    "time_remaining",
                    handle
                        .time_remaining()
                        .map(|t| Value::from(t.as_secs_f64()))
                        .unwrap_or(Value::Null),
                ),
            ]);
            if revolutions >= target_revolutions {
                if held {
                    Tick::Complete
                } else {
                    held = true;
                    Tick::Send(LinkCommand::Hold)
                }
            } else {
                Tick::Continue
            }
        },
    )
    .await;
}

fn landed_value(snap: &Snapshot) -> Value {
    snap.landed_state
        .map(|l| serde_json::to_value(l).unwrap_or(Value::Null))
        .unwrap_or(Value::Null)
}
