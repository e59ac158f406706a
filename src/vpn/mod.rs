//! VPN session orchestration
//!
//! This module contains the state machine, subprocess handling, log
//! monitoring, and management-channel polling behind the session
//! controller.

pub mod management;
pub mod manager;
pub mod monitor;
pub mod process;
pub mod state;
pub mod types;

// Re-export commonly used types for convenience
pub use manager::{SessionManager, SessionOptions, StateChange};
pub use state::{ConnectionEvent, ConnectionState, StateMachine, Transition};
pub use types::{
    ConfigEntry, Credentials, DisconnectReason, SessionInfo, TelemetrySample,
};
