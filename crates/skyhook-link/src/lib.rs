//! Wire-link layer: endpoint parsing, telemetry ingestion and the adapter
//! over the MAVLink transport.
//!
//! The [`LinkBackend`] trait is the seam between the vehicle core and the
//! wire library. [`MavlinkLink`] implements it over the `mavlink` crate;
//! [`MockLink`] implements it over a point-mass simulator for tests and
//! hardware-free runs.

pub mod adapter;
pub mod mavlink_backend;
pub mod mock;
pub mod telemetry;
pub mod watchdog;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use adapter::{Link, LinkBackend, LinkCommand};
pub use mavlink_backend::MavlinkLink;
pub use mock::MockLink;
pub use telemetry::{
    BatteryInfo, FlightMode, GpsInfo, LandedState, Snapshot, TelemetryFrame, TelemetryStore,
    WaitTimeout,
};
pub use watchdog::{LinkHealth, Watchdog};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open link to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("link send failed: {0}")]
    Send(String),
    #[error("link is closed")]
    Closed,
    #[error("invalid endpoint {0:?} (expected udp://host:port, tcp://host:port or serial://device:baud)")]
    InvalidEndpoint(String),
}

/// Connection endpoint for a vehicle link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Udp { host: String, port: u16 },
    Tcp { host: String, port: u16 },
    Serial { device: String, baud: u32 },
}

impl Endpoint {
    /// Connection string in the form the `mavlink` crate expects.
    /// UDP listens (SITL pushes telemetry to us); TCP dials out.
    pub fn mavlink_address(&self) -> String {
        match self {
            Endpoint::Udp { host, port } => format!("udpin:{host}:{port}"),
            Endpoint::Tcp { host, port } => format!("tcpout:{host}:{port}"),
            Endpoint::Serial { device, baud } => format!("serial:{device}:{baud}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LinkError::InvalidEndpoint(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (left, right) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if left.is_empty() {
            return Err(invalid());
        }
        match scheme {
            "udp" => Ok(Endpoint::Udp {
                host: left.to_string(),
                port: right.parse().map_err(|_| invalid())?,
            }),
            "tcp" => Ok(Endpoint::Tcp {
                host: left.to_string(),
                port: right.parse().map_err(|_| invalid())?,
            }),
            "serial" => Ok(Endpoint::Serial {
                device: left.to_string(),
                baud: right.parse().map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Serial { device, baud } => write!(f, "serial://{device}:{baud}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_endpoint() {
        let ep: Endpoint = "udp://127.0.0.1:14550".parse().unwrap();
        assert_eq!(
            ep,
            Endpoint::Udp {
                host: "127.0.0.1".into(),
                port: 14550
            }
        );
        assert_eq!(ep.mavlink_address(), "udpin:127.0.0.1:14550");
        assert_eq!(ep.to_string(), "udp://127.0.0.1:14550");
    }

    #[test]
    fn parses_serial_endpoint() {
        let ep: Endpoint = "serial:///dev/ttyACM0:57600".parse().unwrap();
        assert_eq!(
            ep,
            Endpoint::Serial {
                device: "/dev/ttyACM0".into(),
                baud: 57600
            }
        );
        assert_eq!(ep.mavlink_address(), "serial:/dev/ttyACM0:57600");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!("udp:127.0.0.1:14550".parse::<Endpoint>().is_err());
        assert!("udp://127.0.0.1".parse::<Endpoint>().is_err());
        assert!("ftp://host:21".parse::<Endpoint>().is_err());
        assert!("udp://:14550".parse::<Endpoint>().is_err());
    }
}
