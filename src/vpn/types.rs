//! VPN-related type definitions
//!
//! This module contains the data structures shared between the session
//! controller, the monitor tasks, and the presentation layer.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::ConnectionState;

/// A discovered OpenVPN configuration file
///
/// Immutable once listed; the discovery pass rebuilds the whole list
/// instead of mutating entries in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub path: PathBuf,
}

impl ConfigEntry {
    /// Build an entry from a config file path, using the file stem as the
    /// display name. Returns `None` for paths without a usable file name.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let name = path.file_stem()?.to_str()?.to_string();
        Some(Self {
            name,
            path: path.to_path_buf(),
        })
    }
}

/// Username and secret used to authenticate the OpenVPN session
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Both fields must be non-empty for a connect attempt
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Why a session left the `Connecting`/`Connected` states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The user asked for a disconnect
    UserRequested,
    /// The subprocess rejected the supplied credentials
    AuthenticationFailed,
    /// The subprocess reported a fatal error before exiting
    FatalError(String),
    /// The subprocess exited without a clean disconnect request
    ProcessExited,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserRequested => write!(f, "disconnect requested"),
            DisconnectReason::AuthenticationFailed => write!(f, "authentication failed"),
            DisconnectReason::FatalError(msg) => write!(f, "fatal error: {}", msg),
            DisconnectReason::ProcessExited => write!(f, "process exited"),
        }
    }
}

/// Point-in-time traffic and session reading
///
/// Produced by the management poller; each sample replaces the previous
/// one atomically, so consumers never observe a partial update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Bytes received through the tunnel
    pub bytes_in: u64,
    /// Bytes transmitted through the tunnel
    pub bytes_out: u64,
    /// Seconds since the session was established
    pub elapsed_secs: u64,
    /// Address assigned inside the VPN, once known
    pub tunnel_ip: Option<Ipv4Addr>,
}

impl TelemetrySample {
    pub fn new(
        bytes_in: u64,
        bytes_out: u64,
        elapsed: Duration,
        tunnel_ip: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            bytes_in,
            bytes_out,
            elapsed_secs: elapsed.as_secs(),
            tunnel_ip,
        }
    }
}

/// Read-only snapshot of the live session for the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub config_name: String,
    pub state: ConnectionState,
    pub tunnel_ip: Option<Ipv4Addr>,
    pub started_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_entry_from_path() {
        let entry = ConfigEntry::from_path("/etc/openvpn/client/nl-ams.ovpn").unwrap();
        assert_eq!(entry.name, "nl-ams");
        assert_eq!(entry.path, PathBuf::from("/etc/openvpn/client/nl-ams.ovpn"));
    }

    #[test]
    fn test_credentials_completeness() {
        assert!(Credentials::new("alice", "hunter2").is_complete());
        assert!(!Credentials::new("", "hunter2").is_complete());
        assert!(!Credentials::new("   ", "hunter2").is_complete());
        assert!(!Credentials::new("alice", "").is_complete());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("alice", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert!(DisconnectReason::AuthenticationFailed
            .to_string()
            .contains("authentication"));
        assert_eq!(DisconnectReason::ProcessExited.to_string(), "process exited");
    }

    #[test]
    fn test_telemetry_sample_values_unmodified() {
        let ip: Ipv4Addr = "10.8.0.2".parse().unwrap();
        let sample =
            TelemetrySample::new(1_258_000, 340_500, Duration::from_secs(754), Some(ip));
        assert_eq!(sample.bytes_in, 1_258_000);
        assert_eq!(sample.bytes_out, 340_500);
        assert_eq!(sample.elapsed_secs, 754);
        assert_eq!(sample.tunnel_ip, Some(ip));
    }

    #[test]
    fn test_telemetry_sample_serializes_for_frontend() {
        let sample = TelemetrySample::new(100, 200, Duration::from_secs(3), None);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"bytes_in\":100"));
        assert!(json.contains("\"elapsed_secs\":3"));
    }
}
