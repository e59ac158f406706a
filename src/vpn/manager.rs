//! Session orchestration
//!
//! The `SessionManager` owns the single OpenVPN session: it launches the
//! subprocess, fans its output into the monitor tasks, serializes every
//! lifecycle event through the state machine, and runs the graceful
//! disconnect protocol with a forced-termination fallback.
//!
//! Concurrency layout: monitor tasks feed one dispatcher task over an
//! unbounded channel; the dispatcher is the only writer of lifecycle
//! events while a session is live, except for `disconnect` which injects
//! the disconnect request. State changes are published under the machine
//! lock so observers always see them in the order they happened.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::config;
use crate::error::{Error, Result};
use crate::logging::{LogBuffer, LogLevel};

use super::management::{self, PollerConfig};
use super::monitor::{spawn_monitor, LineEvent, MonitorMessage};
use super::process::{ManagedProcess, ProcessLauncher};
use super::state::{ConnectionEvent, ConnectionState, StateMachine, Transition};
use super::types::{ConfigEntry, Credentials, DisconnectReason, SessionInfo, TelemetrySample};

const EVENTS_CAPACITY: usize = 64;

/// Tuning knobs for the session controller
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// OpenVPN executable name or path
    pub openvpn_binary: String,
    /// Privilege elevation helper; `None` runs OpenVPN directly
    pub elevation: Option<String>,
    /// Local TCP port for the management interface
    pub management_port: u16,
    /// Interval between telemetry polls
    pub poll_interval: Duration,
    /// Per-operation timeout on the management channel
    pub io_timeout: Duration,
    /// Management connect attempts before giving up on telemetry
    pub management_connect_attempts: usize,
    /// Delay between management connect attempts
    pub management_retry_delay: Duration,
    /// How long a graceful disconnect may take before forcing termination
    pub grace_period: Duration,
    /// Directory for the transient auth file
    pub auth_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            openvpn_binary: "openvpn".into(),
            elevation: Some("pkexec".into()),
            management_port: 7505,
            poll_interval: Duration::from_secs(2),
            io_timeout: Duration::from_secs(3),
            management_connect_attempts: 10,
            management_retry_delay: Duration::from_millis(500),
            grace_period: Duration::from_secs(5),
            auth_dir: config::default_config_dir(),
        }
    }
}

impl SessionOptions {
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.openvpn_binary = binary.into();
        self
    }

    pub fn with_elevation(mut self, helper: Option<String>) -> Self {
        self.elevation = helper;
        self
    }

    pub fn with_management_port(mut self, port: u16) -> Self {
        self.management_port = port;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_auth_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.auth_dir = dir.into();
        self
    }

    fn management_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.management_port))
    }
}

/// A published lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Present when the transition was caused by a disconnect or exit
    pub reason: Option<DisconnectReason>,
}

#[derive(Clone)]
struct SessionMeta {
    config_name: String,
    started_at: DateTime<Utc>,
}

/// State shared between the public API and the background tasks
struct Shared {
    machine: Mutex<StateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<StateChange>,
    telemetry_tx: Arc<watch::Sender<Option<TelemetrySample>>>,
    ip_tx: watch::Sender<Option<Ipv4Addr>>,
    logs: Arc<LogBuffer>,
    session: Mutex<Option<SessionMeta>>,
}

impl Shared {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            machine: Mutex::new(StateMachine::new()),
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            events_tx,
            telemetry_tx: Arc::new(watch::Sender::new(None)),
            ip_tx: watch::Sender::new(None),
            logs: Arc::new(LogBuffer::default()),
            session: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Apply an event and publish the transition, all under the lock
    fn apply(&self, event: &ConnectionEvent) -> Option<Transition> {
        let mut machine = self.machine.lock().unwrap();
        let transition = machine.apply(event)?;
        tracing::info!(from = %transition.from, to = %transition.to, "state change");
        self.state_tx.send_replace(transition.to);
        let reason = match event {
            ConnectionEvent::DisconnectRequested => Some(DisconnectReason::UserRequested),
            ConnectionEvent::ProcessExited { reason } => Some(reason.clone()),
            _ => None,
        };
        let _ = self.events_tx.send(StateChange {
            from: transition.from,
            to: transition.to,
            reason,
        });
        Some(transition)
    }
}

struct ActiveSession {
    process: Arc<tokio::sync::Mutex<ManagedProcess>>,
    dispatcher: JoinHandle<()>,
}

/// Controller for the single OpenVPN session
pub struct SessionManager {
    options: SessionOptions,
    launcher: ProcessLauncher,
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(options: SessionOptions) -> Self {
        let launcher = ProcessLauncher::new(
            options.openvpn_binary.clone(),
            options.elevation.clone(),
            options.management_port,
            options.auth_dir.clone(),
        );
        Self {
            options,
            launcher,
            shared: Arc::new(Shared::new()),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch the connection state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx().subscribe()
    }

    /// Subscribe to lifecycle transitions with their reasons
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events_tx.subscribe()
    }

    /// Watch the latest telemetry sample; `None` outside a connected session
    pub fn subscribe_telemetry(&self) -> watch::Receiver<Option<TelemetrySample>> {
        self.shared.telemetry_tx.subscribe()
    }

    /// The session log feed
    pub fn logs(&self) -> Arc<LogBuffer> {
        self.shared.logs.clone()
    }

    /// Snapshot of the live session, if any
    pub fn session_info(&self) -> Option<SessionInfo> {
        let meta = self.shared.session.lock().unwrap().clone()?;
        let telemetry = self.shared.telemetry_tx.borrow().clone();
        Some(SessionInfo {
            config_name: meta.config_name,
            state: self.state(),
            tunnel_ip: *self.shared.ip_tx.borrow(),
            started_at: meta.started_at,
            bytes_in: telemetry.as_ref().map(|t| t.bytes_in).unwrap_or(0),
            bytes_out: telemetry.as_ref().map(|t| t.bytes_out).unwrap_or(0),
        })
    }

    fn state_tx(&self) -> &watch::Sender<ConnectionState> {
        &self.shared.state_tx
    }

    /// Launch a session against the given config
    ///
    /// Returns once the subprocess is spawned and monitored; the tunnel
    /// itself comes up asynchronously and is observable through
    /// `subscribe_state`. Fails fast on precondition violations without
    /// touching the current state.
    pub async fn connect(&self, entry: &ConfigEntry, creds: &Credentials) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            if self.shared.state() != ConnectionState::Disconnected {
                *active = Some(session);
                return Err(Error::AlreadyConnected);
            }
            // Previous session is down; let its dispatcher finish cleanup.
            let _ = session.dispatcher.await;
        }
        if self.shared.state() != ConnectionState::Disconnected {
            return Err(Error::AlreadyConnected);
        }
        if !creds.is_complete() {
            return Err(Error::MissingCredentials);
        }

        // Enter `Connecting` before the spawn so a racing second connect
        // is rejected rather than spawning twice.
        self.shared.apply(&ConnectionEvent::ConnectStarted);
        self.shared
            .logs
            .push(LogLevel::Info, format!("connecting using '{}'", entry.name));

        let mut process = match self.launcher.launch(entry, creds).await {
            Ok(process) => process,
            Err(e) => {
                self.shared.apply(&ConnectionEvent::ProcessExited {
                    reason: DisconnectReason::FatalError(e.to_string()),
                });
                self.shared
                    .logs
                    .push(LogLevel::Error, format!("launch failed: {}", e));
                return Err(e);
            }
        };

        *self.shared.session.lock().unwrap() = Some(SessionMeta {
            config_name: entry.name.clone(),
            started_at: Utc::now(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = process.take_stdout() {
            spawn_monitor(stdout, self.shared.logs.clone(), tx.clone());
        }
        if let Some(stderr) = process.take_stderr() {
            spawn_monitor(stderr, self.shared.logs.clone(), tx.clone());
        }
        drop(tx);

        let process = Arc::new(tokio::sync::Mutex::new(process));
        let dispatcher = tokio::spawn(dispatch_loop(
            self.shared.clone(),
            self.options.clone(),
            process.clone(),
            rx,
        ));
        *active = Some(ActiveSession {
            process,
            dispatcher,
        });
        Ok(())
    }

    /// Gracefully shut the session down
    ///
    /// Asks OpenVPN to exit over the management channel, waits out the
    /// grace period, and forces termination if the subprocess lingers.
    /// A no-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(session) = active.take() else {
            return Ok(());
        };
        if self.shared.state() == ConnectionState::Disconnected {
            let _ = session.dispatcher.await;
            return Ok(());
        }

        self.shared.apply(&ConnectionEvent::DisconnectRequested);
        self.shared.logs.push(LogLevel::Info, "disconnecting");

        if let Err(e) =
            management::send_shutdown(self.options.management_addr(), self.options.io_timeout)
                .await
        {
            // The channel may already be gone; the fallback covers this.
            tracing::debug!("graceful shutdown request failed: {}", e);
        }

        let graceful = {
            let process = session.process.clone();
            timeout(self.options.grace_period, async move {
                let _ = process.lock().await.wait().await;
            })
            .await
            .is_ok()
        };

        if !graceful {
            self.shared.logs.push(
                LogLevel::Warn,
                "graceful shutdown timed out, forcing termination",
            );
            {
                let mut process = session.process.lock().await;
                process.terminate().await?;
            }
            let process = session.process.clone();
            let confirmed = timeout(self.options.grace_period, async move {
                let _ = process.lock().await.wait().await;
            })
            .await
            .is_ok();
            if !confirmed {
                return Err(Error::TerminationTimeout);
            }
        }

        // The dispatcher observes the closed output streams and finishes
        // the teardown.
        let _ = timeout(self.options.grace_period, session.dispatcher).await;
        Ok(())
    }
}

/// Consume monitor messages until the subprocess output streams close
async fn dispatch_loop(
    shared: Arc<Shared>,
    options: SessionOptions,
    process: Arc<tokio::sync::Mutex<ManagedProcess>>,
    mut rx: mpsc::UnboundedReceiver<MonitorMessage>,
) {
    let mut poller: Option<JoinHandle<()>> = None;

    while let Some(message) = rx.recv().await {
        let event = match message {
            MonitorMessage::Event(event) => event,
            MonitorMessage::Eof => continue,
        };
        match event {
            LineEvent::ConnectStarted => {
                // Informational when already connecting.
                shared.apply(&ConnectionEvent::ConnectStarted);
            }
            LineEvent::TunnelIp(ip) => {
                shared.ip_tx.send_replace(Some(ip));
            }
            LineEvent::Established => {
                if shared.apply(&ConnectionEvent::Established).is_some() {
                    shared.logs.push(LogLevel::Info, "tunnel established");
                    poller = Some(tokio::spawn(management::run_poller(
                        PollerConfig {
                            addr: options.management_addr(),
                            poll_interval: options.poll_interval,
                            io_timeout: options.io_timeout,
                            connect_attempts: options.management_connect_attempts,
                            connect_retry_delay: options.management_retry_delay,
                        },
                        shared.state_tx.subscribe(),
                        shared.ip_tx.subscribe(),
                        Instant::now(),
                        shared.telemetry_tx.clone(),
                        shared.logs.clone(),
                    )));
                }
            }
            LineEvent::Exited(reason) => apply_exit(&shared, reason),
        }
    }

    // Streams closed, the subprocess is gone. Redundant when an exit
    // marker was already seen.
    apply_exit(&shared, DisconnectReason::ProcessExited);

    if let Some(poller) = poller.take() {
        poller.abort();
    }
    {
        let mut process = process.lock().await;
        if let Err(e) = process.terminate().await {
            tracing::warn!("termination during teardown failed: {}", e);
        }
        let _ = process.wait().await;
        process.cleanup().await;
    }
    shared.telemetry_tx.send_replace(None);
    shared.ip_tx.send_replace(None);
    *shared.session.lock().unwrap() = None;
}

/// Apply a process-exit event, logging according to how it ended
fn apply_exit(shared: &Shared, reason: DisconnectReason) {
    let Some(transition) = shared.apply(&ConnectionEvent::ProcessExited {
        reason: reason.clone(),
    }) else {
        return;
    };
    match (&reason, transition.from) {
        (DisconnectReason::AuthenticationFailed, _) => {
            shared.logs.push(
                LogLevel::Warn,
                "authentication failed, check the stored credentials",
            );
        }
        (DisconnectReason::FatalError(msg), _) => {
            shared
                .logs
                .push(LogLevel::Error, format!("OpenVPN failed: {}", msg));
        }
        (_, ConnectionState::Disconnecting) => {
            shared.logs.push(LogLevel::Info, "disconnected");
        }
        _ => {
            shared.logs.push(LogLevel::Warn, "OpenVPN exited unexpectedly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_state(
        rx: &mut watch::Receiver<ConnectionState>,
        wanted: ConnectionState,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == wanted {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {}", wanted));
    }

    fn test_options(auth_dir: &std::path::Path) -> SessionOptions {
        // Unused port so the telemetry poller fails fast and quiet.
        SessionOptions::default()
            .with_elevation(None)
            .with_management_port(47999)
            .with_grace_period(Duration::from_millis(300))
            .with_auth_dir(auth_dir)
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_options(dir.path()));

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejects_incomplete_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_options(dir.path()));
        let entry = ConfigEntry::from_path(dir.path().join("site.ovpn")).unwrap();

        let err = manager
            .connect(&entry, &Credentials::new("alice", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCredentials));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_launch_returns_to_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("site.ovpn");
        tokio::fs::write(&config_path, "remote example 1194\n")
            .await
            .unwrap();

        let options = test_options(dir.path()).with_binary("openvpn-definitely-not-installed");
        let manager = SessionManager::new(options);
        let entry = ConfigEntry::from_path(&config_path).unwrap();

        let err = manager
            .connect(&entry, &Credentials::new("alice", "hunter2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // The failed attempt must not poison subsequent connects.
        let err = manager
            .connect(&entry, &Credentials::new("alice", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCredentials));
    }

    #[cfg(unix)]
    mod with_stub {
        use super::*;
        use crate::logging::LogLevel;
        use std::path::{Path, PathBuf};

        fn write_stub(dir: &Path, body: &str) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.join("fake-openvpn");
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn stub_manager(
            dir: &Path,
            script: &str,
        ) -> (SessionManager, ConfigEntry, Credentials) {
            let config_path = dir.join("site.ovpn");
            tokio::fs::write(&config_path, "remote example 1194\n")
                .await
                .unwrap();
            let stub = write_stub(dir, script);

            let options = test_options(dir).with_binary(stub.to_string_lossy().into_owned());
            (
                SessionManager::new(options),
                ConfigEntry::from_path(&config_path).unwrap(),
                Credentials::new("alice", "hunter2"),
            )
        }

        #[tokio::test]
        async fn test_connect_then_disconnect() {
            let dir = tempfile::tempdir().unwrap();
            let script = "#!/bin/sh\n\
                echo 'Initialization Sequence Completed'\n\
                echo '/sbin/ifconfig tun0 10.8.0.2 pointopoint 10.8.0.1 mtu 1500'\n\
                sleep 30\n";
            let (manager, entry, creds) = stub_manager(dir.path(), script).await;

            manager.connect(&entry, &creds).await.unwrap();
            let mut state_rx = manager.subscribe_state();
            wait_for_state(&mut state_rx, ConnectionState::Connected).await;

            let info = manager.session_info().unwrap();
            assert_eq!(info.config_name, "site");
            assert_eq!(info.state, ConnectionState::Connected);

            // Second connect while live must be rejected.
            let err = manager.connect(&entry, &creds).await.unwrap_err();
            assert!(matches!(err, Error::AlreadyConnected));

            manager.disconnect().await.unwrap();
            wait_for_state(&mut state_rx, ConnectionState::Disconnected).await;
            assert!(manager.session_info().is_none());

            // A fresh connect is allowed once fully down.
            manager.connect(&entry, &creds).await.unwrap();
            wait_for_state(&mut state_rx, ConnectionState::Connected).await;
            manager.disconnect().await.unwrap();
        }

        #[tokio::test]
        async fn test_auth_failure_reported_via_events() {
            let dir = tempfile::tempdir().unwrap();
            let script = "#!/bin/sh\n\
                echo \"AUTH: Received control message: AUTH_FAILED\"\n";
            let (manager, entry, creds) = stub_manager(dir.path(), script).await;

            let mut events = manager.subscribe_events();
            manager.connect(&entry, &creds).await.unwrap();

            let change = loop {
                let change = timeout(Duration::from_secs(5), events.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if change.to == ConnectionState::Disconnected {
                    break change;
                }
            };
            assert_eq!(change.from, ConnectionState::Connecting);
            assert_eq!(change.reason, Some(DisconnectReason::AuthenticationFailed));

            let warnings = manager.logs().get_filtered(LogLevel::Warn);
            assert!(warnings.iter().any(|e| e.message.contains("authentication")));
        }

        #[tokio::test]
        async fn test_unexpected_exit_warns_once() {
            let dir = tempfile::tempdir().unwrap();
            let script = "#!/bin/sh\n\
                echo 'Initialization Sequence Completed'\n\
                sleep 0.5\n";
            let (manager, entry, creds) = stub_manager(dir.path(), script).await;

            manager.connect(&entry, &creds).await.unwrap();
            let mut state_rx = manager.subscribe_state();
            wait_for_state(&mut state_rx, ConnectionState::Connected).await;
            wait_for_state(&mut state_rx, ConnectionState::Disconnected).await;

            // Give the dispatcher time to drain both stream EOFs.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let unexpected = manager
                .logs()
                .get_filtered(LogLevel::Warn)
                .into_iter()
                .filter(|e| e.message.contains("unexpectedly"))
                .count();
            assert_eq!(unexpected, 1);
        }

        #[tokio::test]
        async fn test_telemetry_resets_after_disconnect() {
            let dir = tempfile::tempdir().unwrap();
            let script = "#!/bin/sh\n\
                echo 'Initialization Sequence Completed'\n\
                sleep 30\n";
            let (manager, entry, creds) = stub_manager(dir.path(), script).await;

            manager.connect(&entry, &creds).await.unwrap();
            let mut state_rx = manager.subscribe_state();
            wait_for_state(&mut state_rx, ConnectionState::Connected).await;

            manager.disconnect().await.unwrap();
            wait_for_state(&mut state_rx, ConnectionState::Disconnected).await;
            assert!(manager.subscribe_telemetry().borrow().is_none());
        }
    }
}
