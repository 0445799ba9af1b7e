use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use skyhook_geo::read_plan;
use skyhook_link::MockLink;
use skyhook_mission::{run_mission, supervise, MissionOutcome};
use skyhook_safety::{SafetyCheckerServer, SafetyConfig, SafetyLimits};
use skyhook_vehicle::{Vehicle, VehicleOptions, VehicleType};

#[derive(Debug, Parser)]
#[command(name = "skyhook", version, about = "skyhook - scriptable vehicle control over MAVLink")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VehicleKind {
    Drone,
    Rover,
    /// Simulated vehicle, no hardware or SITL needed.
    None,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fly the waypoints of a QGroundControl .plan file.
    Run {
        /// Connection endpoint: udp://host:port, tcp://host:port or
        /// serial://device:baud. Ignored for --vehicle none.
        #[arg(long)]
        conn: Option<String>,
        #[arg(long, value_enum, default_value = "drone")]
        vehicle: VehicleKind,
        /// Mission plan file.
        #[arg(long)]
        file: PathBuf,
        /// Safety limits YAML; defaults apply when omitted.
        #[arg(long)]
        limits: Option<PathBuf>,
        /// Geofence checker address (host:port).
        #[arg(long)]
        checker: Option<String>,
        /// Telemetry sampling rate for the flight log, in Hz.
        #[arg(long, default_value_t = 1.0)]
        samplerate: f64,
        /// Write sampled telemetry as JSON lines to this file.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Takeoff altitude when the plan starts with a zero-altitude item.
        #[arg(long, default_value_t = 10.0)]
        takeoff_alt: f64,
    },
    /// Run the geofence validator server.
    Server {
        /// Safety config YAML (vehicle type, bounds, geofence polygons).
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "0.0.0.0:14580")]
        bind: String,
    },
    /// Validate configuration files without flying.
    Doctor {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        limits: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Run {
            conn,
            vehicle,
            file,
            limits,
            checker,
            samplerate,
            output,
            takeoff_alt,
        } => {
            let code = run(
                conn, vehicle, file, limits, checker, samplerate, output, takeoff_alt,
            )
            .await?;
            std::process::exit(code);
        }
        Command::Server { config, bind } => server(config, bind).await,
        Command::Doctor { config, limits } => doctor(config, limits),
    }
}

fn load_limits(path: Option<&PathBuf>) -> Result<SafetyLimits> {
    match path {
        None => Ok(SafetyLimits::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read limits file {}", path.display()))?;
            let limits: SafetyLimits = serde_yaml::from_str(&raw).context("parse limits yaml")?;
            limits
                .validate()
                .map_err(|reason| anyhow::anyhow!("invalid limits: {reason}"))?;
            Ok(limits)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    conn: Option<String>,
    kind: VehicleKind,
    file: PathBuf,
    limits: Option<PathBuf>,
    checker: Option<String>,
    samplerate: f64,
    output: Option<PathBuf>,
    takeoff_alt: f64,
) -> Result<i32> {
    let waypoints = read_plan(&file).with_context(|| format!("read plan {}", file.display()))?;
    anyhow::ensure!(!waypoints.is_empty(), "plan contains no nav items");
    info!(count = waypoints.len(), "plan loaded");

    let options = VehicleOptions {
        limits: load_limits(limits.as_ref())?,
        vehicle_type: match kind {
            VehicleKind::Rover => VehicleType::Rover,
            _ => VehicleType::Copter,
        },
        checker_addr: checker,
        ..VehicleOptions::default()
    };

    let vehicle = match kind {
        VehicleKind::None => Vehicle::new(Arc::new(MockLink::new()), options),
        _ => {
            let conn = conn.context("--conn is required unless --vehicle none")?;
            Vehicle::for_endpoint(&conn, options)?
        }
    };

    info!("connecting");
    if let Err(e) = vehicle.connect().await {
        eprintln!("connection failed: {e}");
        return Ok(2);
    }

    if samplerate > 0.0 {
        spawn_sampler(vehicle.clone(), samplerate, output);
    }

    let rover = kind == VehicleKind::Rover;
    let mission = run_mission(vehicle.clone(), move |v| async move {
        v.arm().await?;
        if !rover {
            let first_alt = waypoints
                .iter()
                .map(|w| w.coordinate.alt)
                .find(|alt| *alt > 0.5)
                .unwrap_or(takeoff_alt);
            info!(altitude = first_alt, "taking off");
            v.takeoff(first_alt).await?.result().await.require_success()?;
        }
        for (i, waypoint) in waypoints.iter().enumerate() {
            info!(
                leg = i + 1,
                total = waypoints.len(),
                waypoint = %waypoint.coordinate,
                "flying waypoint"
            );
            v.fly_waypoint(waypoint).await?;
        }
        info!("plan complete, returning to launch");
        v.rtl().await?.result().await.require_success()?;
        Ok(())
    });

    let outcome = supervise(vehicle, mission).await;
    match &outcome {
        MissionOutcome::Completed => info!("mission completed"),
        MissionOutcome::Interrupted => warn!("mission interrupted"),
        MissionOutcome::Aborted(e) => warn!("mission aborted: {e:#}"),
        MissionOutcome::Failed(e) => warn!("mission failed: {e:#}"),
    }
    Ok(outcome.exit_code())
}

/// Periodically log (and optionally record) the vehicle state.
fn spawn_sampler(vehicle: Vehicle, rate_hz: f64, output: Option<PathBuf>) {
    let period = Duration::from_secs_f64(1.0 / rate_hz.clamp(0.1, 50.0));
    tokio::spawn(async move {
        let mut sink = output.and_then(|path| match std::fs::File::create(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("could not open {}: {e}", path.display());
                None
            }
        });
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let snap = vehicle.snapshot();
            if let (Some(pos), Some(velocity)) = (&snap.position, &snap.velocity) {
                info!(
                    lat = pos.lat,
                    lon = pos.lon,
                    alt = pos.alt,
                    groundspeed = velocity.magnitude(true),
                    armed = snap.armed.unwrap_or(false),
                    "telemetry"
                );
                if let Some(file) = sink.as_mut() {
                    let line = serde_json::json!({
                        "lat": pos.lat,
                        "lon": pos.lon,
                        "alt": pos.alt,
                        "heading": snap.heading,
                        "groundspeed": velocity.magnitude(true),
                        "battery": snap.battery.map(|b| b.percentage),
                        "armed": snap.armed,
                    });
                    if writeln!(file, "{line}").is_err() {
                        sink = None;
                    }
                }
            }
        }
    });
}

async fn server(config: PathBuf, bind: String) -> Result<()> {
    let config = SafetyConfig::load(&config)
        .with_context(|| format!("load safety config {}", config.display()))?;
    info!(vehicle_type = ?config.vehicle_type, "starting geofence checker");
    let (addr, handle) = SafetyCheckerServer::new(config)
        .spawn(bind)
        .await
        .context("bind checker server")?;
    info!(%addr, "serving");
    handle.await.context("server task ended")?;
    Ok(())
}

fn doctor(config: Option<PathBuf>, limits: Option<PathBuf>) -> Result<()> {
    let mut checked = false;
    if let Some(path) = config {
        let config = SafetyConfig::load(&path)
            .with_context(|| format!("safety config {}", path.display()))?;
        println!(
            "safety config OK: {:?}, {} include / {} exclude polygon(s)",
            config.vehicle_type,
            config.include_geofences.len(),
            config.exclude_geofences.len()
        );
        checked = true;
    }
    if limits.is_some() {
        let limits = load_limits(limits.as_ref())?;
        println!(
            "limits OK: max_speed={} m/s, battery min/critical {}/{}%",
            limits.max_speed, limits.min_battery_percent, limits.critical_battery_percent
        );
        checked = true;
    }
    anyhow::ensure!(checked, "nothing to check; pass --config and/or --limits");
    println!("doctor: OK");
    Ok(())
}
