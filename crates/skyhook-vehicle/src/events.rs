use tokio::sync::broadcast;

use skyhook_safety::SafetyViolationType;

use crate::handle::CommandStatus;

/// Typed event bus payloads. A fixed set of events, each with a
/// well-defined payload; subscribe via `Vehicle::events()`.
#[derive(Debug, Clone)]
pub enum VehicleEvent {
    Connected,
    Disconnected,
    Armed,
    Disarmed,
    CommandStarted {
        command: &'static str,
    },
    CommandFinished {
        command: &'static str,
        status: CommandStatus,
    },
    AbortTriggered,
    SafetyViolation {
        kind: SafetyViolationType,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<VehicleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VehicleEvent> {
        self.tx.subscribe()
    }

    /// Lossy by design: events are advisory, nobody blocks on them.
    pub fn emit(&self, event: VehicleEvent) {
        let _ = self.tx.send(event);
    }
}
