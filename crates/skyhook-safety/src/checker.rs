use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skyhook_geo::Coordinate;

use crate::geofence::{path_crosses_polygon, point_in_polygon, GeofencePoint};
use crate::{SafetyConfig, VehicleType};

pub const CHECKER_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_FRAME_BYTES: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum GeofenceError {
    #[error("geofence server did not reply within {0:?}")]
    Unavailable(Duration),
    #[error("geofence transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("geofence protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WirePoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl From<&Coordinate> for WirePoint {
    fn from(c: &Coordinate) -> Self {
        WirePoint {
            lat: c.lat,
            lon: c.lon,
            alt: c.alt,
        }
    }
}

/// One request to the geofence validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CheckRequest {
    Status,
    Waypoint { from: WirePoint, to: WirePoint },
    Speed { speed: f64 },
    Takeoff { alt: f64, lat: f64, lon: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckReply {
    Status {
        ok: bool,
    },
    Verdict {
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub valid: bool,
    pub reason: Option<String>,
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, GeofenceError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(GeofenceError::Protocol(format!("frame of {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Client side of the geofence validator.
///
/// The transport is exclusive per client instance; requests are
/// exactly-once per call with a 1 s reply deadline. Retry policy belongs to
/// the caller.
pub struct SafetyCheckerClient {
    stream: Mutex<TcpStream>,
    timeout: Duration,
}

impl SafetyCheckerClient {
    pub async fn connect(addr: impl Into<String>) -> Result<Self, GeofenceError> {
        let addr = addr.into();
        let stream = tokio::time::timeout(CHECKER_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| GeofenceError::Unavailable(CHECKER_TIMEOUT))??;
        debug!(%addr, "geofence checker connected");
        Ok(Self {
            stream: Mutex::new(stream),
            timeout: CHECKER_TIMEOUT,
        })
    }

    async fn request(&self, request: &CheckRequest) -> Result<CheckReply, GeofenceError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| GeofenceError::Protocol(e.to_string()))?;
        let mut stream = self.stream.lock().await;
        let exchange = async {
            write_frame(&mut stream, &payload).await?;
            read_frame(&mut stream).await
        };
        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| GeofenceError::Unavailable(self.timeout))??;
        serde_json::from_slice(&reply).map_err(|e| GeofenceError::Protocol(e.to_string()))
    }

    fn expect_verdict(reply: CheckReply) -> Result<Verdict, GeofenceError> {
        match reply {
            CheckReply::Verdict { valid, reason } => Ok(Verdict { valid, reason }),
            CheckReply::Status { .. } => {
                Err(GeofenceError::Protocol("expected a verdict reply".into()))
            }
        }
    }

    pub async fn status(&self) -> Result<bool, GeofenceError> {
        match self.request(&CheckRequest::Status).await? {
            CheckReply::Status { ok } => Ok(ok),
            CheckReply::Verdict { valid, .. } => Ok(valid),
        }
    }

    pub async fn validate_waypoint(
        &self,
        from: &Coordinate,
        to: &Coordinate,
    ) -> Result<Verdict, GeofenceError> {
        let reply = self
            .request(&CheckRequest::Waypoint {
                from: from.into(),
                to: to.into(),
            })
            .await?;
        Self::expect_verdict(reply)
    }

    pub async fn validate_speed(&self, speed: f64) -> Result<Verdict, GeofenceError> {
        let reply = self.request(&CheckRequest::Speed { speed }).await?;
        Self::expect_verdict(reply)
    }

    pub async fn validate_takeoff(
        &self,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<Verdict, GeofenceError> {
        let reply = self.request(&CheckRequest::Takeoff { alt, lat, lon }).await?;
        Self::expect_verdict(reply)
    }
}

/// Geofence validator server. Stateless per request; the whole policy
/// lives in the [`SafetyConfig`].
pub struct SafetyCheckerServer {
    config: SafetyConfig,
}

impl SafetyCheckerServer {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    /// Bind and serve until the task is dropped. Returns the bound address
    /// (useful with port 0) and the accept-loop handle.
    pub async fn spawn(
        self,
        bind: impl Into<String>,
    ) -> Result<(SocketAddr, JoinHandle<()>), GeofenceError> {
        let listener = TcpListener::bind(bind.into()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "geofence checker listening");
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                debug!(%peer, "checker client connected");
                let config = self.config.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &config).await {
                        debug!(%peer, "checker connection closed: {e}");
                    }
                });
            }
        });
        Ok((addr, handle))
    }

    /// Evaluate one request against the configured policy.
    pub fn evaluate(config: &SafetyConfig, request: &CheckRequest) -> CheckReply {
        match request {
            CheckRequest::Status => CheckReply::Status { ok: true },
            CheckRequest::Speed { speed } => {
                if *speed >= config.min_speed && *speed <= config.max_speed {
                    CheckReply::Verdict {
                        valid: true,
                        reason: None,
                    }
                } else {
                    CheckReply::Verdict {
                        valid: false,
                        reason: Some(format!(
                            "speed {speed} outside [{}, {}]",
                            config.min_speed, config.max_speed
                        )),
                    }
                }
            }
            CheckRequest::Takeoff { alt, lat, lon } => {
                if config.vehicle_type == VehicleType::Copter
                    && (*alt < config.min_altitude || *alt > config.max_altitude)
                {
                    return CheckReply::Verdict {
                        valid: false,
                        reason: Some(format!(
                            "takeoff altitude {alt} outside [{}, {}]",
                            config.min_altitude, config.max_altitude
                        )),
                    };
                }
                Self::check_point(config, *lat, *lon)
            }
            CheckRequest::Waypoint { from, to } => {
                if config.vehicle_type == VehicleType::Copter
                    && (to.alt < config.min_altitude || to.alt > config.max_altitude)
                {
                    return CheckReply::Verdict {
                        valid: false,
                        reason: Some(format!(
                            "altitude {} outside [{}, {}]",
                            to.alt, config.min_altitude, config.max_altitude
                        )),
                    };
                }
                match Self::check_point(config, to.lat, to.lon) {
                    CheckReply::Verdict { valid: true, .. } if config.validate_paths => {
                        let a = GeofencePoint {
                            lat: from.lat,
                            lon: from.lon,
                        };
                        let b = GeofencePoint {
                            lat: to.lat,
                            lon: to.lon,
                        };
                        let crossing = config
                            .include_geofences
                            .iter()
                            .chain(config.exclude_geofences.iter())
                            .any(|polygon| path_crosses_polygon(a, b, polygon));
                        if crossing {
                            CheckReply::Verdict {
                                valid: false,
                                reason: Some("path crosses a geofence boundary".into()),
                            }
                        } else {
                            CheckReply::Verdict {
                                valid: true,
                                reason: None,
                            }
                        }
                    }
                    verdict => verdict,
                }
            }
        }
    }

    fn check_point(config: &SafetyConfig, lat: f64, lon: f64) -> CheckReply {
        for polygon in &config.include_geofences {
            if !point_in_polygon(polygon, lat, lon) {
                return CheckReply::Verdict {
                    valid: false,
                    reason: Some("target outside include geofence".into()),
                };
            }
        }
        for polygon in &config.exclude_geofences {
            if point_in_polygon(polygon, lat, lon) {
                return CheckReply::Verdict {
                    valid: false,
                    reason: Some("target inside exclude geofence".into()),
                };
            }
        }
        CheckReply::Verdict {
            valid: true,
            reason: None,
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    config: &SafetyConfig,
) -> Result<(), GeofenceError> {
    loop {
        let payload = read_frame(&mut stream).await?;
        let request: CheckRequest = serde_json::from_slice(&payload)
            .map_err(|e| GeofenceError::Protocol(e.to_string()))?;
        let reply = SafetyCheckerServer::evaluate(config, &request);
        let encoded =
            serde_json::to_vec(&reply).map_err(|e| GeofenceError::Protocol(e.to_string()))?;
        write_frame(&mut stream, &encoded).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(center_lat: f64, center_lon: f64, half_deg: f64) -> Vec<GeofencePoint> {
        vec![
            GeofencePoint {
                lat: center_lat - half_deg,
                lon: center_lon - half_deg,
            },
            GeofencePoint {
                lat: center_lat - half_deg,
                lon: center_lon + half_deg,
            },
            GeofencePoint {
                lat: center_lat + half_deg,
                lon: center_lon + half_deg,
            },
            GeofencePoint {
                lat: center_lat + half_deg,
                lon: center_lon - half_deg,
            },
        ]
    }

    fn test_config() -> SafetyConfig {
        SafetyConfig {
            vehicle_type: VehicleType::Copter,
            min_speed: 0.0,
            max_speed: 10.0,
            min_altitude: 0.0,
            max_altitude: 100.0,
            include_geofences: vec![square(35.7275, -78.696, 0.001)],
            exclude_geofences: vec![square(35.7275, -78.696, 0.0002)],
            validate_paths: false,
        }
    }

    #[test]
    fn wire_format_matches_protocol() {
        let encoded = serde_json::to_value(&CheckRequest::Status).unwrap();
        assert_eq!(encoded, serde_json::json!({"op": "status"}));

        let encoded = serde_json::to_value(&CheckRequest::Speed { speed: 4.0 }).unwrap();
        assert_eq!(encoded, serde_json::json!({"op": "speed", "speed": 4.0}));

        let reply: CheckReply = serde_json::from_str(r#"{"valid": false, "reason": "x"}"#).unwrap();
        assert_eq!(
            reply,
            CheckReply::Verdict {
                valid: false,
                reason: Some("x".into())
            }
        );
        let reply: CheckReply = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert_eq!(reply, CheckReply::Status { ok: true });
    }

    #[test]
    fn evaluate_include_exclude_ring() {
        let config = test_config();
        // Inside include, outside exclude: valid.
        let mid = CheckRequest::Waypoint {
            from: WirePoint {
                lat: 35.7275,
                lon: -78.696,
                alt: 10.0,
            },
            to: WirePoint {
                lat: 35.7275 + 0.0005,
                lon: -78.696,
                alt: 10.0,
            },
        };
        assert!(matches!(
            SafetyCheckerServer::evaluate(&config, &mid),
            CheckReply::Verdict { valid: true, .. }
        ));

        // Dead center: inside the exclude polygon.
        let center = CheckRequest::Waypoint {
            from: WirePoint {
                lat: 35.7275 + 0.0005,
                lon: -78.696,
                alt: 10.0,
            },
            to: WirePoint {
                lat: 35.7275,
                lon: -78.696,
                alt: 10.0,
            },
        };
        assert!(matches!(
            SafetyCheckerServer::evaluate(&config, &center),
            CheckReply::Verdict { valid: false, .. }
        ));

        // Far away: outside the include polygon.
        let outside = CheckRequest::Waypoint {
            from: WirePoint {
                lat: 35.7275,
                lon: -78.696,
                alt: 10.0,
            },
            to: WirePoint {
                lat: 35.74,
                lon: -78.696,
                alt: 10.0,
            },
        };
        assert!(matches!(
            SafetyCheckerServer::evaluate(&config, &outside),
            CheckReply::Verdict { valid: false, .. }
        ));
    }

    #[test]
    fn evaluate_altitude_and_speed_bounds() {
        let config = test_config();
        let high = CheckRequest::Waypoint {
            from: WirePoint {
                lat: 35.7275,
                lon: -78.696,
                alt: 10.0,
            },
            to: WirePoint {
                lat: 35.7275 + 0.0005,
                lon: -78.696,
                alt: 250.0,
            },
        };
        assert!(matches!(
            SafetyCheckerServer::evaluate(&config, &high),
            CheckReply::Verdict { valid: false, .. }
        ));
        assert!(matches!(
            SafetyCheckerServer::evaluate(&config, &CheckRequest::Speed { speed: 25.0 }),
            CheckReply::Verdict { valid: false, .. }
        ));
        assert!(matches!(
            SafetyCheckerServer::evaluate(&config, &CheckRequest::Speed { speed: 5.0 }),
            CheckReply::Verdict { valid: true, .. }
        ));
    }

    #[test]
    fn path_validation_rejects_boundary_crossing() {
        // Both endpoints sit clear of the exclude square, but the straight
        // line between them clips it.
        let through_exclude = CheckRequest::Waypoint {
            from: WirePoint {
                lat: 35.7275,
                lon: -78.696 - 0.0005,
                alt: 10.0,
            },
            to: WirePoint {
                lat: 35.7275,
                lon: -78.696 + 0.0005,
                alt: 10.0,
            },
        };

        let lenient = test_config();
        assert!(matches!(
            SafetyCheckerServer::evaluate(&lenient, &through_exclude),
            CheckReply::Verdict { valid: true, .. }
        ));

        let mut strict = test_config();
        strict.validate_paths = true;
        assert!(matches!(
            SafetyCheckerServer::evaluate(&strict, &through_exclude),
            CheckReply::Verdict { valid: false, .. }
        ));
    }

    #[tokio::test]
    async fn client_server_round_trip() {
        let server = SafetyCheckerServer::new(test_config());
        let (addr, _handle) = server.spawn("127.0.0.1:0").await.unwrap();

        let client = SafetyCheckerClient::connect(addr.to_string()).await.unwrap();
        assert!(client.status().await.unwrap());

        let from = Coordinate::new(35.7275, -78.696, 10.0);
        let to = Coordinate::new(35.7275 + 0.0005, -78.696, 10.0);
        let verdict = client.validate_waypoint(&from, &to).await.unwrap();
        assert!(verdict.valid);

        let far = Coordinate::new(35.74, -78.696, 10.0);
        let verdict = client.validate_waypoint(&from, &far).await.unwrap();
        assert!(!verdict.valid);
        assert!(verdict.reason.is_some());

        assert!(client.validate_speed(3.0).await.unwrap().valid);
        assert!(!client.validate_speed(30.0).await.unwrap().valid);
        assert!(client
            .validate_takeoff(35.7275, -78.696 - 0.0005, 20.0)
            .await
            .unwrap()
            .valid);
    }

    #[tokio::test]
    async fn unreachable_server_reports_unavailable() {
        // Nothing listens on this port.
        let result = SafetyCheckerClient::connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
