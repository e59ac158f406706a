//! Subprocess log monitoring
//!
//! Reads the OpenVPN diagnostic output one line at a time until
//! end-of-stream and classifies each line against a fixed, ordered set of
//! patterns. Every line also lands verbatim on the log feed with a capture
//! timestamp; only classified lines influence the session lifecycle.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::logging::{LogBuffer, LogLevel};

use super::state::ConnectionEvent;
use super::types::DisconnectReason;

/// A lifecycle-relevant signal extracted from one log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// OpenVPN started initializing the connection
    ConnectStarted,
    /// Initialization sequence completed; the tunnel is up
    Established,
    /// Tunnel address pushed by the server or applied to the interface
    TunnelIp(Ipv4Addr),
    /// OpenVPN is going away, with the reason derived from the line
    Exited(DisconnectReason),
}

impl LineEvent {
    /// Map to a state-machine event; telemetry-only signals map to `None`
    pub fn to_connection_event(&self) -> Option<ConnectionEvent> {
        match self {
            LineEvent::ConnectStarted => Some(ConnectionEvent::ConnectStarted),
            LineEvent::Established => Some(ConnectionEvent::Established),
            LineEvent::TunnelIp(_) => None,
            LineEvent::Exited(reason) => Some(ConnectionEvent::ProcessExited {
                reason: reason.clone(),
            }),
        }
    }
}

/// A message from a monitor task to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorMessage {
    Event(LineEvent),
    /// The output stream reached end-of-file
    Eof,
}

fn ifconfig_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)ifconfig[ ,]+(?:tun\d+[ ,]+)?(\d{1,3}(?:\.\d{1,3}){3})")
            .expect("invalid ifconfig pattern")
    })
}

/// Classify one diagnostic line, first matching pattern wins
///
/// Pattern order matters: terminal failure markers are checked before the
/// generic exit markers so the attached reason is as specific as possible.
pub fn classify_line(line: &str) -> Option<LineEvent> {
    let lower = line.to_ascii_lowercase();

    if lower.contains("initialization sequence completed") {
        return Some(LineEvent::Established);
    }
    if lower.contains("auth_failed") {
        return Some(LineEvent::Exited(DisconnectReason::AuthenticationFailed));
    }
    if lower.contains("fatal") {
        return Some(LineEvent::Exited(DisconnectReason::FatalError(
            line.trim().to_string(),
        )));
    }
    if lower.contains("sigterm") || lower.contains("process exiting") {
        return Some(LineEvent::Exited(DisconnectReason::ProcessExited));
    }
    if lower.contains("initialization started") {
        return Some(LineEvent::ConnectStarted);
    }
    if let Some(caps) = ifconfig_re().captures(line) {
        if let Ok(ip) = caps[1].parse::<Ipv4Addr>() {
            return Some(LineEvent::TunnelIp(ip));
        }
    }

    None
}

/// Spawn a task reading the given stream line-by-line until end-of-stream
///
/// Each line is appended to the log feed; classified lines are forwarded
/// to the dispatcher. A final `Eof` message signals that the stream (and
/// therefore the subprocess) is gone. Never blocks the caller.
pub(crate) fn spawn_monitor<R>(
    stream: R,
    logs: Arc<LogBuffer>,
    tx: mpsc::UnboundedSender<MonitorMessage>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    logs.push(LogLevel::Info, line);
                    if let Some(event) = classify_line(line) {
                        if tx.send(MonitorMessage::Event(event)).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("log stream read error: {}", e);
                    break;
                }
            }
        }
        let _ = tx.send(MonitorMessage::Eof);
    })
}
