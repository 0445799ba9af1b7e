use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

use skyhook_link::{Snapshot, TelemetryStore};

use crate::SafetyLimits;

pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyViolationType {
    BatteryLow,
    BatteryCritical,
    SpeedTooHigh,
    VerticalSpeedTooHigh,
    GpsPoor,
}

#[derive(Debug, Clone)]
pub struct SafetyViolation {
    pub kind: SafetyViolationType,
    pub message: String,
    pub value: f64,
    pub limit: f64,
}

/// Action taken when the battery goes critical with the failsafe enabled.
/// The vehicle core implements this with its own `rtl()`.
#[async_trait]
pub trait Failsafe: Send + Sync {
    async fn return_to_launch(&self);
}

type ViolationCallback = Box<dyn Fn(&SafetyViolation) + Send + Sync>;

/// Cooperative background monitor sampling telemetry every 500 ms.
///
/// Reads only; any reaction beyond the battery failsafe is up to the
/// registered callbacks. At most one callback per violation type fires per
/// cycle.
pub struct SafetyMonitor {
    limits: SafetyLimits,
    store: TelemetryStore,
    callbacks: Mutex<HashMap<SafetyViolationType, ViolationCallback>>,
    failsafe: Mutex<Option<Arc<dyn Failsafe>>>,
    failsafe_latched: AtomicBool,
    running: AtomicBool,
}

impl SafetyMonitor {
    pub fn new(limits: SafetyLimits, store: TelemetryStore) -> Arc<Self> {
        Arc::new(Self {
            limits,
            store,
            callbacks: Mutex::new(HashMap::new()),
            failsafe: Mutex::new(None),
            failsafe_latched: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// Register the callback for one violation type, replacing any previous
    /// one.
    pub fn on_violation(
        &self,
        kind: SafetyViolationType,
        callback: impl Fn(&SafetyViolation) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .unwrap()
            .insert(kind, Box::new(callback));
    }

    pub fn set_failsafe(&self, failsafe: Arc<dyn Failsafe>) {
        *self.failsafe.lock().unwrap() = Some(failsafe);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let monitor = self;
        monitor.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while monitor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                monitor.cycle().await;
            }
        })
    }

    async fn cycle(&self) {
        let snapshot = self.store.snapshot();
        let violations = scan(&snapshot, &self.limits);
        let mut critical = false;
        for violation in &violations {
            warn!(
                kind = ?violation.kind,
                value = violation.value,
                limit = violation.limit,
                "{}",
                violation.message
            );
            if violation.kind == SafetyViolationType::BatteryCritical {
                critical = true;
            }
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(callback) = callbacks.get(&violation.kind) {
                callback(violation);
            }
        }

        if critical && self.limits.enable_battery_failsafe {
            // Trigger RTL once per critical episode, not every cycle.
            if !self.failsafe_latched.swap(true, Ordering::SeqCst) {
                let failsafe = self.failsafe.lock().unwrap().clone();
                if let Some(failsafe) = failsafe {
                    warn!("battery critical, engaging RTL failsafe");
                    failsafe.return_to_launch().await;
                }
            }
        } else if !critical {
            self.failsafe_latched.store(false, Ordering::SeqCst);
        }
    }
}

/// Evaluate one snapshot against the limits. Pure; at most one violation
/// per type.
pub fn scan(snapshot: &Snapshot, limits: &SafetyLimits) -> Vec<SafetyViolation> {
    let mut violations = Vec::new();

    if let Some(battery) = &snapshot.battery {
        if battery.percentage < limits.critical_battery_percent {
            violations.push(SafetyViolation {
                kind: SafetyViolationType::BatteryCritical,
                message: format!(
                    "battery critically low: {:.0}% < {:.0}%",
                    battery.percentage, limits.critical_battery_percent
                ),
                value: battery.percentage,
                limit: limits.critical_battery_percent,
            });
        } else if battery.percentage < limits.min_battery_percent {
            violations.push(SafetyViolation {
                kind: SafetyViolationType::BatteryLow,
                message: format!(
                    "battery low: {:.0}% < {:.0}%",
                    battery.percentage, limits.min_battery_percent
                ),
                value: battery.percentage,
                limit: limits.min_battery_percent,
            });
        }
    }

    if limits.enable_speed_limits {
        if let Some(velocity) = &snapshot.velocity {
            let horizontal = velocity.magnitude(true);
            if horizontal > limits.max_speed {
                violations.push(SafetyViolation {
                    kind: SafetyViolationType::SpeedTooHigh,
                    message: format!(
                        "speed {horizontal:.1} m/s above limit {:.1} m/s",
                        limits.max_speed
                    ),
                    value: horizontal,
                    limit: limits.max_speed,
                });
            }
            if velocity.down.abs() > limits.max_vertical_speed {
                violations.push(SafetyViolation {
                    kind: SafetyViolationType::VerticalSpeedTooHigh,
                    message: format!(
                        "vertical speed {:.1} m/s above limit {:.1} m/s",
                        velocity.down.abs(),
                        limits.max_vertical_speed
                    ),
                    value: velocity.down.abs(),
                    limit: limits.max_vertical_speed,
                });
            }
        }
    }

    if let Some(gps) = &snapshot.gps {
        if gps.satellites < limits.min_satellites {
            violations.push(SafetyViolation {
                kind: SafetyViolationType::GpsPoor,
                message: format!(
                    "{} satellites visible, limit is {}",
                    gps.satellites, limits.min_satellites
                ),
                value: gps.satellites as f64,
                limit: limits.min_satellites as f64,
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyhook_geo::VectorNED;
    use skyhook_link::{BatteryInfo, GpsInfo, TelemetryFrame};

    fn snapshot_with(battery: f64, speed: f64, sats: u32) -> Snapshot {
        Snapshot {
            generation: 1,
            battery: Some(BatteryInfo {
                voltage: 12.0,
                current: 2.0,
                percentage: battery,
            }),
            velocity: Some(VectorNED::new(speed, 0.0, 0.0)),
            gps: Some(GpsInfo {
                fix_type: 3,
                satellites: sats,
                lat: 0.0,
                lon: 0.0,
            }),
            ..Snapshot::default()
        }
    }

    #[test]
    fn healthy_snapshot_has_no_violations() {
        assert!(scan(&snapshot_with(80.0, 3.0, 10), &SafetyLimits::default()).is_empty());
    }

    #[test]
    fn battery_thresholds_pick_one_violation() {
        let limits = SafetyLimits::default();
        let low = scan(&snapshot_with(15.0, 0.0, 10), &limits);
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].kind, SafetyViolationType::BatteryLow);

        let critical = scan(&snapshot_with(5.0, 0.0, 10), &limits);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].kind, SafetyViolationType::BatteryCritical);
    }

    #[test]
    fn speed_and_gps_violations() {
        let limits = SafetyLimits::default();
        let kinds: Vec<_> = scan(&snapshot_with(80.0, 15.0, 4), &limits)
            .into_iter()
            .map(|v| v.kind)
            .collect();
        assert!(kinds.contains(&SafetyViolationType::SpeedTooHigh));
        assert!(kinds.contains(&SafetyViolationType::GpsPoor));
    }

    #[test]
    fn disabled_speed_limits_mute_speed_violations() {
        let limits = SafetyLimits::disabled();
        let kinds: Vec<_> = scan(&snapshot_with(80.0, 50.0, 10), &limits)
            .into_iter()
            .map(|v| v.kind)
            .collect();
        assert!(!kinds.contains(&SafetyViolationType::SpeedTooHigh));
    }

    struct RecordingFailsafe(Arc<AtomicBool>);

    #[async_trait]
    impl Failsafe for RecordingFailsafe {
        async fn return_to_launch(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn critical_battery_triggers_failsafe_once() {
        let store = TelemetryStore::new();
        store.apply(TelemetryFrame::Battery(BatteryInfo {
            voltage: 11.0,
            current: 5.0,
            percentage: 4.0,
        }));

        let monitor = SafetyMonitor::new(SafetyLimits::default(), store.clone());
        let fired = Arc::new(AtomicBool::new(false));
        monitor.set_failsafe(Arc::new(RecordingFailsafe(fired.clone())));

        let hits = Arc::new(AtomicBool::new(false));
        monitor.on_violation(SafetyViolationType::BatteryCritical, {
            let hits = hits.clone();
            move |_| hits.store(true, Ordering::SeqCst)
        });

        let handle = monitor.clone().start();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        monitor.stop();
        let _ = handle.await;

        assert!(fired.load(Ordering::SeqCst), "failsafe should have fired");
        assert!(hits.load(Ordering::SeqCst), "callback should have fired");
    }
}
