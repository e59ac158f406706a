//! OpenVPN management channel
//!
//! Line-oriented TCP client for the management interface the subprocess is
//! launched with, plus the background poller that turns `status` replies
//! into telemetry samples. Telemetry is strictly best-effort: a missing or
//! unreachable management channel degrades the session to "no counters",
//! never tears it down.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

use crate::error::{Error, Result};
use crate::logging::{LogBuffer, LogLevel};

use super::state::ConnectionState;
use super::types::TelemetrySample;

/// Counters extracted from one `status` reply
///
/// Fields are independently optional: a truncated or reordered reply
/// yields whatever counters were present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,
}

impl StatusReport {
    pub fn is_complete(&self) -> bool {
        self.bytes_in.is_some() && self.bytes_out.is_some()
    }
}

/// Parse the body of a `status` reply into traffic counters
///
/// Unrecognized lines are ignored so unrelated additions to the reply
/// format cannot break polling.
pub fn parse_status(body: &str) -> StatusReport {
    let mut report = StatusReport::default();
    for line in body.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("TCP/UDP read bytes,") {
            report.bytes_in = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("TCP/UDP write bytes,") {
            report.bytes_out = value.trim().parse().ok();
        }
    }
    report
}

/// Client for one management-channel TCP connection
pub struct ManagementClient {
    stream: BufReader<TcpStream>,
}

impl ManagementClient {
    /// Connect and consume the greeting banner
    pub async fn connect(addr: SocketAddr, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Management(format!("connect to {} timed out", addr)))??;

        let mut client = Self {
            stream: BufReader::new(stream),
        };
        // The interface sends one ">INFO:..." banner line on connect.
        client.read_line(io_timeout).await?;
        Ok(client)
    }

    /// Send `status` and parse the counters out of the reply
    pub async fn status(&mut self, io_timeout: Duration) -> Result<StatusReport> {
        self.write_command("status", io_timeout).await?;

        let deadline = Instant::now() + io_timeout;
        let mut body = String::new();
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| Error::Management("status reply timed out".into()))?;
            let line = self.read_line(remaining).await?;
            if line.trim() == "END" {
                break;
            }
            body.push_str(&line);
        }
        Ok(parse_status(&body))
    }

    /// Ask OpenVPN to shut down gracefully
    pub async fn signal_sigterm(&mut self, io_timeout: Duration) -> Result<()> {
        self.write_command("signal SIGTERM", io_timeout).await
    }

    async fn write_command(&mut self, command: &str, io_timeout: Duration) -> Result<()> {
        let payload = format!("{}\r\n", command);
        timeout(io_timeout, async {
            self.stream.write_all(payload.as_bytes()).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| Error::Management(format!("sending {:?} timed out", command)))??;
        Ok(())
    }

    async fn read_line(&mut self, io_timeout: Duration) -> Result<String> {
        let mut line = String::new();
        let n = timeout(io_timeout, self.stream.read_line(&mut line))
            .await
            .map_err(|_| Error::Management("management read timed out".into()))??;
        if n == 0 {
            return Err(Error::Management("management connection closed".into()));
        }
        Ok(line)
    }
}

/// Connect to the management channel and request a graceful shutdown
///
/// Used by the disconnect path; failure here just means the fallback
/// termination path takes over.
pub async fn send_shutdown(addr: SocketAddr, io_timeout: Duration) -> Result<()> {
    let mut client = ManagementClient::connect(addr, io_timeout).await?;
    client.signal_sigterm(io_timeout).await
}

/// Tuning for the telemetry poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub addr: SocketAddr,
    pub poll_interval: Duration,
    pub io_timeout: Duration,
    pub connect_attempts: usize,
    pub connect_retry_delay: Duration,
}

/// Poll the management channel while the session stays connected
///
/// Publishes one telemetry sample per successful poll; each sample
/// replaces the previous one. Exits as soon as the session leaves the
/// connected state or the channel becomes unusable.
pub async fn run_poller(
    config: PollerConfig,
    mut state_rx: watch::Receiver<ConnectionState>,
    ip_rx: watch::Receiver<Option<Ipv4Addr>>,
    established_at: Instant,
    telemetry: Arc<watch::Sender<Option<TelemetrySample>>>,
    logs: Arc<LogBuffer>,
) {
    let connect = || ManagementClient::connect(config.addr, config.io_timeout);
    let mut client = match connect
        .retry(
            ConstantBuilder::default()
                .with_delay(config.connect_retry_delay)
                .with_max_times(config.connect_attempts),
        )
        .await
    {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("management channel unreachable: {}", e);
            logs.push(
                LogLevel::Warn,
                "telemetry unavailable: management channel unreachable",
            );
            return;
        }
    };

    let mut ticker = tokio::time::interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if *state_rx.borrow() != ConnectionState::Connected {
                    return;
                }
                continue;
            }
        }
        if *state_rx.borrow() != ConnectionState::Connected {
            return;
        }

        match client.status(config.io_timeout).await {
            Ok(report) if report.is_complete() => {
                let sample = TelemetrySample::new(
                    report.bytes_in.unwrap_or(0),
                    report.bytes_out.unwrap_or(0),
                    established_at.elapsed(),
                    *ip_rx.borrow(),
                );
                telemetry.send_replace(Some(sample));
            }
            Ok(_) => {
                // Counters missing from the reply; keep the last sample.
                tracing::debug!("incomplete status reply, skipping sample");
            }
            Err(e) => {
                tracing::debug!("management poll failed: {}", e);
                logs.push(LogLevel::Warn, format!("telemetry poll failed: {}", e));
                return;
            }
        }
    }
}
