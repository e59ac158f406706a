//! OpenVPN session supervision for desktop clients
//!
//! Wraps an `openvpn` subprocess behind a small async API: launch against
//! a chosen config, watch the connection state, read live traffic
//! telemetry from the management interface, and disconnect gracefully
//! with a forced fallback. One session at a time.
//!
//! ```rust,ignore
//! use ovpn_session::{SessionManager, SessionOptions};
//!
//! let manager = SessionManager::new(SessionOptions::default());
//! let configs = ovpn_session::config::discover_configs(&dir).await?;
//! manager.connect(&configs[0], &credentials).await?;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod vpn;

pub use error::{Error, Result};
pub use logging::{LogBuffer, LogEntry, LogFilterState, LogLevel};
pub use vpn::{
    ConfigEntry, ConnectionState, Credentials, DisconnectReason, SessionInfo, SessionManager,
    SessionOptions, StateChange, TelemetrySample,
};
