use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use skyhook_vehicle::{Vehicle, VehicleError};

/// How long an interrupted mission gets to unwind after `abort()`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Terminal state of a supervised mission, with the process exit code the
/// launcher should use.
#[derive(Debug)]
pub enum MissionOutcome {
    Completed,
    /// SIGINT/SIGTERM received; the vehicle was told to abort.
    Interrupted,
    /// Ended by the abort flag or a safety rejection.
    Aborted(anyhow::Error),
    Failed(anyhow::Error),
}

impl MissionOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            MissionOutcome::Completed => 0,
            MissionOutcome::Failed(_) => 1,
            MissionOutcome::Aborted(_) => 3,
            MissionOutcome::Interrupted => 130,
        }
    }
}

/// Run a mission future under signal supervision.
///
/// On SIGINT/SIGTERM the vehicle is aborted (RTL) and the mission gets
/// [`SHUTDOWN_GRACE`] to unwind on its own; abort-gated commands failing
/// fast is what unwinds it. The mission future is never dropped mid-step
/// before that grace period expires.
pub async fn supervise<Fut>(vehicle: Vehicle, mission: Fut) -> MissionOutcome
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    tokio::pin!(mission);

    let result = tokio::select! {
        result = &mut mission => return classify(result),
        _ = shutdown_signal() => {
            warn!("interrupt received, aborting mission");
            if let Err(e) = vehicle.abort(true).await {
                error!("abort RTL failed to start: {e}");
            }
            tokio::time::timeout(SHUTDOWN_GRACE, &mut mission).await
        }
    };

    match result {
        Ok(_) => MissionOutcome::Interrupted,
        Err(_) => {
            error!(
                "mission did not terminate within {}s of abort",
                SHUTDOWN_GRACE.as_secs()
            );
            MissionOutcome::Interrupted
        }
    }
}

fn classify(result: anyhow::Result<()>) -> MissionOutcome {
    match result {
        Ok(()) => MissionOutcome::Completed,
        Err(e) => {
            let safety_stop = e
                .downcast_ref::<VehicleError>()
                .map(|ve| {
                    matches!(
                        ve,
                        VehicleError::Abort { .. }
                            | VehicleError::GeofenceViolation { .. }
                            | VehicleError::SpeedLimitExceeded { .. }
                            | VehicleError::PreflightCheckFailed { .. }
                    )
                })
                .unwrap_or(false);
            if safety_stop {
                MissionOutcome::Aborted(e)
            } else {
                MissionOutcome::Failed(e)
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("could not install SIGTERM handler: {e}");
                std::future::pending().await
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
