use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use skyhook_geo::{Coordinate, VectorNED};

/// Autopilot flight mode, mapped best-effort from the wire heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightMode {
    Unknown,
    Manual,
    Guided,
    Mission,
    Hold,
    Offboard,
    ReturnToLaunch,
    Land,
    Takeoff,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandedState {
    Unknown,
    OnGround,
    InAir,
    TakingOff,
    Landing,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub voltage: f64,
    pub current: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsInfo {
    /// 0-1: no fix, 2: 2D, 3+: 3D and better.
    pub fix_type: u8,
    pub satellites: u32,
    pub lat: f64,
    pub lon: f64,
}

impl GpsInfo {
    pub fn has_3d_fix(&self) -> bool {
        self.fix_type >= 3
    }
}

/// One decoded telemetry message from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    Heartbeat {
        flight_mode: FlightMode,
        armed: bool,
    },
    /// Geodetic position; altitude relative to home.
    Position {
        lat: f64,
        lon: f64,
        alt: f64,
    },
    VelocityNed(VectorNED),
    Heading(f64),
    Hud {
        airspeed: f64,
        groundspeed: f64,
        climb_rate: f64,
    },
    Battery(BatteryInfo),
    Gps(GpsInfo),
    Landed(LandedState),
    InAir(bool),
    Home(Coordinate),
}

/// Latest-known vehicle telemetry.
///
/// Every field starts at its unknown sentinel (`None` / `Unknown`) until
/// the corresponding stream yields a first value. `generation` increments
/// on every applied frame so readers can detect staleness.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub generation: u64,
    pub position: Option<Coordinate>,
    pub heading: Option<f64>,
    pub velocity: Option<VectorNED>,
    pub groundspeed: Option<f64>,
    pub airspeed: Option<f64>,
    pub climb_rate: Option<f64>,
    pub flight_mode: Option<FlightMode>,
    pub landed_state: Option<LandedState>,
    pub armed: Option<bool>,
    pub in_air: Option<bool>,
    pub battery: Option<BatteryInfo>,
    pub gps: Option<GpsInfo>,
    pub home: Option<Coordinate>,
}

impl Snapshot {
    pub fn altitude(&self) -> Option<f64> {
        self.position.as_ref().map(|p| p.alt)
    }

    /// 3D distance from the current position to home, when both are known.
    pub fn distance_to_home(&self) -> Option<f64> {
        match (&self.position, &self.home) {
            (Some(pos), Some(home)) => Some(pos.distance_to(home)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("telemetry predicate not satisfied within {0:?}")]
pub struct WaitTimeout(pub Duration);

/// Shared, watch-backed snapshot of the vehicle state.
///
/// A single ingestion task applies frames; any number of readers observe
/// whole snapshots (no torn reads) and can suspend until a predicate holds.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Snapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Fold one frame into the snapshot. Fields updated by the same frame
    /// become visible to readers atomically.
    pub fn apply(&self, frame: TelemetryFrame) {
        self.tx.send_modify(|snap| {
            snap.generation += 1;
            match frame {
                TelemetryFrame::Heartbeat { flight_mode, armed } => {
                    snap.flight_mode = Some(flight_mode);
                    snap.armed = Some(armed);
                }
                TelemetryFrame::Position { lat, lon, alt } => {
                    snap.position = Some(Coordinate::new(lat, lon, alt));
                }
                TelemetryFrame::VelocityNed(v) => snap.velocity = Some(v),
                TelemetryFrame::Heading(h) => snap.heading = Some(h),
                TelemetryFrame::Hud {
                    airspeed,
                    groundspeed,
                    climb_rate,
                } => {
                    snap.airspeed = Some(airspeed);
                    snap.groundspeed = Some(groundspeed);
                    snap.climb_rate = Some(climb_rate);
                }
                TelemetryFrame::Battery(b) => snap.battery = Some(b),
                TelemetryFrame::Gps(g) => snap.gps = Some(g),
                TelemetryFrame::Landed(l) => snap.landed_state = Some(l),
                TelemetryFrame::InAir(a) => snap.in_air = Some(a),
                TelemetryFrame::Home(c) => snap.home = Some(c),
            }
        });
    }

    /// Suspend until `pred` is satisfied by the current or a newly observed
    /// snapshot, or until `timeout` passes.
    pub async fn wait_until<F>(&self, pred: F, timeout: Duration) -> Result<Snapshot, WaitTimeout>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                {
                    let snap = rx.borrow_and_update();
                    if pred(&snap) {
                        return snap.clone();
                    }
                }
                if rx.changed().await.is_err() {
                    // Store dropped; park until the timeout fires.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| WaitTimeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_start_unknown_and_generation_counts() {
        let store = TelemetryStore::new();
        let snap = store.snapshot();
        assert_eq!(snap.generation, 0);
        assert!(snap.position.is_none());
        assert!(snap.battery.is_none());

        store.apply(TelemetryFrame::Position {
            lat: 35.7275,
            lon: -78.696,
            alt: 12.0,
        });
        store.apply(TelemetryFrame::Heading(45.0));
        let snap = store.snapshot();
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.altitude(), Some(12.0));
        assert_eq!(snap.heading, Some(45.0));
    }

    #[test]
    fn distance_to_home_needs_both_ends() {
        let store = TelemetryStore::new();
        assert!(store.snapshot().distance_to_home().is_none());
        store.apply(TelemetryFrame::Home(Coordinate::new(35.7275, -78.696, 0.0)));
        store.apply(TelemetryFrame::Position {
            lat: 35.7275,
            lon: -78.696,
            alt: 30.0,
        });
        let d = store.snapshot().distance_to_home().unwrap();
        assert!((d - 30.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn wait_until_sees_new_snapshots() {
        let store = TelemetryStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait_until(|s| s.altitude().unwrap_or(0.0) >= 10.0, Duration::from_secs(2))
                    .await
            })
        };
        for alt in [2.0, 6.0, 11.0] {
            store.apply(TelemetryFrame::Position {
                lat: 0.0,
                lon: 0.0,
                alt,
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = waiter.await.unwrap().expect("predicate should be reached");
        assert!(snap.altitude().unwrap() >= 10.0);
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let store = TelemetryStore::new();
        let err = store
            .wait_until(|s| s.armed == Some(true), Duration::from_millis(50))
            .await;
        assert!(err.is_err());
    }
}
