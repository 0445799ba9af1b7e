//! End-to-end command flows against the simulated link.

use std::sync::Arc;
use std::time::Duration;

use skyhook_geo::{Coordinate, VectorNED};
use skyhook_link::{LinkCommand, MockLink};
use skyhook_safety::{GeofencePoint, SafetyCheckerServer, SafetyConfig, SafetyLimits, VehicleType};
use skyhook_vehicle::{
    CommandStatus, GotoOptions, OrbitOptions, SetVelocityOptions, Vehicle, VehicleError,
    VehicleOptions,
};

async fn setup(scale: f64, limits: SafetyLimits) -> (Vehicle, Arc<MockLink>) {
    let mock = Arc::new(MockLink::accelerated(scale));
    let vehicle = Vehicle::new(
        mock.clone(),
        VehicleOptions {
            limits,
            ..VehicleOptions::default()
        },
    );
    vehicle.connect().await.expect("connect");
    (vehicle, mock)
}

async fn airborne(scale: f64) -> (Vehicle, Arc<MockLink>) {
    let (vehicle, mock) = setup(scale, SafetyLimits::default()).await;
    vehicle.arm().await.expect("arm");
    let result = vehicle.takeoff(10.0).await.expect("takeoff").await;
    assert!(result.succeeded(), "takeoff failed: {:?}", result.error);
    (vehicle, mock)
}

#[tokio::test]
async fn takeoff_then_land() {
    let (vehicle, _mock) = setup(10.0, SafetyLimits::default()).await;
    vehicle.arm().await.unwrap();
    assert!(vehicle.armed());

    let takeoff = vehicle.takeoff(10.0).await.unwrap().await;
    assert_eq!(takeoff.status, CommandStatus::Completed);
    let altitude = vehicle.altitude().unwrap();
    assert!((9.5..=10.5).contains(&altitude), "altitude {altitude}");
    assert!(vehicle.in_air());

    let land = vehicle.land().await.unwrap().await;
    assert_eq!(land.status, CommandStatus::Completed);
    assert!(!vehicle.armed());
    assert!(!vehicle.in_air());
    vehicle.disconnect().await;
}

#[tokio::test]
async fn square_flight_returns_to_origin() {
    let (vehicle, _mock) = airborne(20.0).await;
    let origin = vehicle.position().unwrap();

    let legs = [
        VectorNED::new(20.0, 0.0, 0.0),
        VectorNED::new(0.0, 20.0, 0.0),
        VectorNED::new(-20.0, 0.0, 0.0),
        VectorNED::new(0.0, -20.0, 0.0),
    ];
    let mut here = origin.clone();
    for leg in legs {
        here = here.offset_by(leg);
        let result = vehicle.goto(here.clone(), GotoOptions::default()).await.unwrap().await;
        assert!(result.succeeded(), "leg failed: {:?}", result.error);
    }

    let final_pos = vehicle.position().unwrap();
    assert!(
        final_pos.distance_to(&origin) < 3.0,
        "ended {}m from origin",
        final_pos.distance_to(&origin)
    );
    vehicle.disconnect().await;
}

#[tokio::test]
async fn goto_cancellation_freezes_vehicle() {
    let (vehicle, mock) = airborne(5.0).await;
    let start = vehicle.position().unwrap();
    let far = start.offset_by(VectorNED::new(500.0, 0.0, 0.0));

    let handle = vehicle.goto(far, GotoOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.is_running());
    let moving = vehicle.velocity().unwrap().magnitude(true);
    assert!(moving > 1.0, "expected motion, got {moving} m/s");

    let cancelled = tokio::time::timeout(Duration::from_secs(1), handle.cancel(true))
        .await
        .expect("cancel should acknowledge within a second");
    assert!(cancelled);
    assert!(handle.was_cancelled());
    assert!(mock.sent().contains(&LinkCommand::Hold));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let speed = vehicle.velocity().unwrap().magnitude(true);
    assert!(speed < 1.0, "still moving at {speed} m/s after cancel");
    vehicle.disconnect().await;
}

#[tokio::test]
async fn preflight_failure_blocks_arm() {
    let limits = SafetyLimits {
        min_battery_percent: 95.0,
        critical_battery_percent: 10.0,
        ..SafetyLimits::default()
    };
    let (vehicle, mock) = setup(1.0, limits).await;
    mock.set_battery_percent(80.0);
    vehicle
        .store()
        .wait_until(
            |s| s.battery.map(|b| b.percentage <= 80.0).unwrap_or(false),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    mock.clear_sent();

    let err = vehicle.arm().await.expect_err("arm should fail preflight");
    match err {
        VehicleError::PreflightCheckFailed { result } => {
            assert!(result.failed_checks().contains(&"battery".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(
        !mock.sent().contains(&LinkCommand::Arm),
        "no arm command may reach the wire"
    );
    vehicle.disconnect().await;
}

#[tokio::test]
async fn abort_gate_fails_fast_without_wire_traffic() {
    let (vehicle, mock) = airborne(10.0).await;
    let target = vehicle
        .position()
        .unwrap()
        .offset_by(VectorNED::new(50.0, 0.0, 0.0));

    let abort_handle = vehicle.abort(false).await.unwrap();
    abort_handle.await;
    assert!(vehicle.is_aborted());
    mock.clear_sent();

    for result in [
        vehicle.goto(target.clone(), GotoOptions::default()).await.err(),
        vehicle.takeoff(20.0).await.err(),
        vehicle
            .set_velocity(VectorNED::new(1.0, 0.0, 0.0), SetVelocityOptions::default())
            .await
            .err(),
        vehicle
            .orbit(target.clone(), 10.0, OrbitOptions::default())
            .await
            .err(),
    ] {
        assert!(
            matches!(result, Some(VehicleError::Abort { .. })),
            "expected AbortError, got {result:?}"
        );
    }
    assert!(mock.sent().is_empty(), "abort gate must not touch the wire");

    vehicle.reset_abort();
    let handle = vehicle.goto(target, GotoOptions::default()).await.unwrap();
    assert!(handle.await.succeeded());
    vehicle.disconnect().await;
}

#[tokio::test]
async fn orbit_accumulates_revolutions() {
    let (vehicle, _mock) = airborne(30.0).await;
    let center = vehicle
        .position()
        .unwrap()
        .offset_by(VectorNED::new(10.0, 0.0, 0.0));

    let handle = vehicle
        .orbit(
            center.clone(),
            10.0,
            OrbitOptions {
                speed: 5.0,
                clockwise: true,
                revolutions: 2.0,
            },
        )
        .await
        .unwrap();

    // revolutions_completed must be monotonic while running.
    let mut last = 0.0f64;
    while !handle.is_complete() {
        if let Some(revs) = handle.progress().get("revolutions_completed").and_then(|v| v.as_f64()) {
            assert!(revs >= last - 1e-9, "revolutions went backwards: {last} -> {revs}");
            last = revs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let result = handle.result().await;
    assert!(result.succeeded(), "orbit failed: {:?}", result.error);
    let revs = result.details["revolutions_completed"].as_f64().unwrap();
    assert!(revs >= 2.0, "terminal revolutions {revs}");

    let ring_error =
        (vehicle.position().unwrap().ground_distance_to(&center) - 10.0).abs();
    assert!(ring_error < 5.0, "ended {ring_error}m off the orbit circle");
    vehicle.disconnect().await;
}

#[tokio::test]
async fn navigation_commands_are_rejected_while_busy() {
    let (vehicle, _mock) = airborne(5.0).await;
    let start = vehicle.position().unwrap();
    let far = start.offset_by(VectorNED::new(300.0, 0.0, 0.0));

    let first = vehicle.goto(far, GotoOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = vehicle
        .goto(
            start.offset_by(VectorNED::new(0.0, 50.0, 0.0)),
            GotoOptions::default(),
        )
        .await;
    assert!(matches!(
        second,
        Err(VehicleError::CommandBusy { active: "goto" })
    ));

    // Recovery commands supersede instead.
    let rtl = vehicle.rtl().await.unwrap();
    let first_result = first.result().await;
    assert_eq!(first_result.status, CommandStatus::Cancelled);
    let rtl_result = rtl.await;
    assert!(rtl_result.succeeded(), "rtl failed: {:?}", rtl_result.error);
    assert!(!vehicle.armed());
    vehicle.disconnect().await;
}

#[tokio::test]
async fn continuous_velocity_is_superseded_by_next_command() {
    let (vehicle, _mock) = airborne(10.0).await;
    let cruise = vehicle
        .set_velocity(VectorNED::new(2.0, 0.0, 0.0), SetVelocityOptions::default())
        .await
        .unwrap();
    assert!(cruise.is_continuous());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cruise.is_running());

    let target = vehicle
        .position()
        .unwrap()
        .offset_by(VectorNED::new(30.0, 0.0, 0.0));
    let goto = vehicle.goto(target, GotoOptions::default()).await.unwrap();
    let cruise_result = cruise.result().await;
    assert_eq!(cruise_result.status, CommandStatus::Cancelled);
    assert!(goto.await.succeeded());
    vehicle.disconnect().await;
}

#[tokio::test]
async fn timed_velocity_self_terminates() {
    let (vehicle, _mock) = airborne(10.0).await;
    let handle = vehicle
        .set_velocity(
            VectorNED::new(3.0, 0.0, 0.0),
            SetVelocityOptions {
                heading: None,
                duration: Some(Duration::from_secs(1)),
            },
        )
        .await
        .unwrap();
    assert!(!handle.is_continuous());
    let result = handle.await;
    assert!(result.succeeded(), "timed velocity failed: {:?}", result.error);
    let elapsed = result.details["elapsed"].as_f64().unwrap();
    assert!(elapsed >= 1.0, "completed after only {elapsed}s");
    vehicle.disconnect().await;
}

#[tokio::test]
async fn speed_validation_and_clamping() {
    // Rejecting limits: over-limit speed errors out.
    let (vehicle, _mock) = airborne(10.0).await;
    let err = vehicle.set_groundspeed(50.0).await.expect_err("over limit");
    assert!(matches!(err, VehicleError::SpeedLimitExceeded { .. }));
    vehicle.disconnect().await;

    // Clamping limits: the same request is clamped instead.
    let limits = SafetyLimits {
        auto_clamp_values: true,
        ..SafetyLimits::default()
    };
    let (vehicle, mock) = setup(10.0, limits.clone()).await;
    vehicle.set_groundspeed(50.0).await.expect("clamped");
    assert!(mock
        .sent()
        .contains(&LinkCommand::SetMaximumSpeed { speed: limits.max_speed }));
    vehicle.disconnect().await;
}

#[tokio::test]
async fn geofence_rejection_blocks_goto() {
    // ~100m include square centered on the spawn point.
    let spawn = Coordinate::new(35.727436, -78.696587, 0.0);
    let half = 0.00045;
    let config = SafetyConfig {
        vehicle_type: VehicleType::Copter,
        min_speed: 0.0,
        max_speed: 20.0,
        min_altitude: 0.0,
        max_altitude: 120.0,
        include_geofences: vec![vec![
            GeofencePoint { lat: spawn.lat - half, lon: spawn.lon - half },
            GeofencePoint { lat: spawn.lat - half, lon: spawn.lon + half },
            GeofencePoint { lat: spawn.lat + half, lon: spawn.lon + half },
            GeofencePoint { lat: spawn.lat + half, lon: spawn.lon - half },
        ]],
        exclude_geofences: Vec::new(),
        validate_paths: false,
    };
    let (addr, _server) = SafetyCheckerServer::new(config).spawn("127.0.0.1:0").await.unwrap();

    let mock = Arc::new(MockLink::accelerated(10.0));
    let vehicle = Vehicle::new(
        mock.clone(),
        VehicleOptions {
            checker_addr: Some(addr.to_string()),
            ..VehicleOptions::default()
        },
    );
    vehicle.connect().await.unwrap();
    vehicle.arm().await.unwrap();
    vehicle.takeoff(10.0).await.unwrap().await.require_success().unwrap();

    let target = vehicle
        .position()
        .unwrap()
        .offset_by(VectorNED::new(200.0, 0.0, 0.0));
    mock.clear_sent();
    let err = vehicle
        .goto(target.clone(), GotoOptions::default())
        .await
        .expect_err("goto must be rejected");
    match err {
        VehicleError::GeofenceViolation {
            target_position, ..
        } => {
            let rejected = target_position.expect("rejected target recorded");
            assert!(rejected.distance_to(&target) < 1e-6);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(
        !mock
            .sent()
            .iter()
            .any(|c| matches!(c, LinkCommand::GotoLocation { .. })),
        "no goto wire command may be sent"
    );

    // A nearby target inside the fence still flies.
    let near = vehicle
        .position()
        .unwrap()
        .offset_by(VectorNED::new(20.0, 0.0, 0.0));
    assert!(vehicle.goto(near, GotoOptions::default()).await.unwrap().await.succeeded());
    vehicle.disconnect().await;
}

#[tokio::test]
async fn set_heading_converges() {
    let (vehicle, _mock) = airborne(10.0).await;
    let result = vehicle.set_heading(135.0).await.unwrap().await;
    assert!(result.succeeded(), "set_heading failed: {:?}", result.error);
    let heading = vehicle.heading().unwrap();
    let diff = skyhook_geo::heading_difference(heading, 135.0).abs();
    assert!(diff <= 2.0, "heading off by {diff} degrees");
    vehicle.disconnect().await;
}

#[tokio::test]
async fn unavailable_telemetry_is_typed() {
    let mock = Arc::new(MockLink::new());
    let vehicle = Vehicle::new(mock, VehicleOptions::default());
    // Not connected: nothing has been ingested yet.
    assert!(matches!(
        vehicle.position(),
        Err(VehicleError::UnavailableTelemetry("position"))
    ));
    assert!(matches!(
        vehicle.battery(),
        Err(VehicleError::UnavailableTelemetry("battery"))
    ));
}
