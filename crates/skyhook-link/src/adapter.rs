use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use skyhook_geo::VectorNED;

use crate::telemetry::TelemetryStore;
use crate::LinkError;

/// One outbound instruction to the autopilot.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Arm,
    Disarm { force: bool },
    Takeoff { altitude: f64 },
    Land,
    ReturnToLaunch,
    Hold,
    GotoLocation {
        lat: f64,
        lon: f64,
        alt: f64,
        yaw: Option<f64>,
    },
    SetVelocityNed {
        velocity: VectorNED,
        yaw: Option<f64>,
    },
    SetMaximumSpeed { speed: f64 },
    StartOrbit {
        lat: f64,
        lon: f64,
        radius: f64,
        speed: f64,
        clockwise: bool,
    },
}

impl LinkCommand {
    pub fn name(&self) -> &'static str {
        match self {
            LinkCommand::Arm => "arm",
            LinkCommand::Disarm { .. } => "disarm",
            LinkCommand::Takeoff { .. } => "takeoff",
            LinkCommand::Land => "land",
            LinkCommand::ReturnToLaunch => "rtl",
            LinkCommand::Hold => "hold",
            LinkCommand::GotoLocation { .. } => "goto_location",
            LinkCommand::SetVelocityNed { .. } => "set_velocity_ned",
            LinkCommand::SetMaximumSpeed { .. } => "set_maximum_speed",
            LinkCommand::StartOrbit { .. } => "start_orbit",
        }
    }
}

/// Backend seam over the wire library.
///
/// `start` spins up telemetry ingestion into the given store and returns
/// once the link is live; `send` issues one command. Implementations must
/// tolerate `shutdown` racing in-flight sends.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    async fn start(&self, store: TelemetryStore) -> Result<(), LinkError>;
    async fn send(&self, cmd: LinkCommand) -> Result<(), LinkError>;
    async fn shutdown(&self);
}

/// A started link: backend plus its telemetry store.
///
/// Outbound commands are serialized here so at most one is on the wire at
/// a time per vehicle, regardless of how many tasks issue them.
pub struct Link {
    backend: Arc<dyn LinkBackend>,
    store: TelemetryStore,
    tx_gate: Mutex<()>,
}

impl Link {
    pub fn new(backend: Arc<dyn LinkBackend>) -> Self {
        Self {
            backend,
            store: TelemetryStore::new(),
            tx_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub async fn start(&self) -> Result<(), LinkError> {
        self.backend.start(self.store.clone()).await
    }

    pub async fn send(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        let _gate = self.tx_gate.lock().await;
        tracing::trace!(command = cmd.name(), "link send");
        self.backend.send(cmd).await
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}
