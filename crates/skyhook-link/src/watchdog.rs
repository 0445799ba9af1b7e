use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::error;

use crate::telemetry::TelemetryStore;

/// Link liveness as seen by the heartbeat watchdog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkHealth {
    pub alive: bool,
    /// Time since the last applied telemetry frame.
    pub last_frame_age: Duration,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            alive: true,
            last_frame_age: Duration::ZERO,
        }
    }
}

/// Watches telemetry recency and flags a lost link.
///
/// Telemetry generation is the heartbeat indicator: any applied frame
/// counts. Checking starts after a short grace period so a freshly opened
/// link is not declared dead before the first message arrives.
pub struct Watchdog;

impl Watchdog {
    pub fn spawn(
        store: TelemetryStore,
        timeout: Duration,
        grace: Duration,
    ) -> watch::Receiver<LinkHealth> {
        let (tx, rx) = watch::channel(LinkHealth::default());
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut last_generation = store.generation();
            let mut last_change = Instant::now();
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                let generation = store.generation();
                if generation != last_generation {
                    last_generation = generation;
                    last_change = Instant::now();
                }
                let age = last_change.elapsed();
                let alive = age <= timeout;
                let changed = tx.send_if_modified(|health| {
                    let flipped = health.alive != alive;
                    health.alive = alive;
                    health.last_frame_age = age;
                    flipped
                });
                if changed && !alive {
                    error!("link heartbeat lost ({:.1}s since last frame)", age.as_secs_f64());
                }
                if tx.receiver_count() == 0 {
                    break;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryFrame;

    #[tokio::test]
    async fn flags_stale_link_and_recovers() {
        let store = TelemetryStore::new();
        let mut health = Watchdog::spawn(
            store.clone(),
            Duration::from_millis(600),
            Duration::from_millis(0),
        );

        // Fresh frames keep it alive.
        store.apply(TelemetryFrame::Heading(0.0));
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(health.borrow().alive);

        // Silence beyond the timeout flips it.
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                health.changed().await.unwrap();
                if !health.borrow().alive {
                    break;
                }
            }
        })
        .await
        .expect("watchdog should flag a silent link");

        // Traffic resumes: alive again.
        store.apply(TelemetryFrame::Heading(1.0));
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                health.changed().await.unwrap();
                if health.borrow().alive {
                    break;
                }
            }
        })
        .await
        .expect("watchdog should recover");
    }
}
