//! Backend Sessions
//!
//! One session type per protocol, all speaking the same lifecycle
//! contract. [`Backend`] is the closed set the manager dispatches over.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!                               │                  │
//!                              err            disconnect
//!                               ▼                  ▼
//!                             Error ──▶ Disconnected ◀── Disconnecting
//! ```

mod openvpn;
mod socks;
mod ssh;
mod wireguard;

pub use openvpn::OpenVpnSession;
pub use socks::LocalSocksSession;
pub use ssh::{OpenSshConnector, RemoteTunnel, SshConnector, SshSession, SshTarget, TunnelCheck};
pub use wireguard::WireGuardSession;

use crate::config::{Protocol, ProtocolConfig};
use crate::liveness::{LivenessMonitor, Transition};
use crate::log::LogSink;
use crate::process::{LaunchError, ProcessHandle, ProcessStatus, Supervisor, is_elevation_denial};
use crate::proxy::{ProxyConfigError, ProxyController, ProxyEndpoint, ProxyGuard};
use crate::settings::Settings;
use crate::uplink::UplinkProbe;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing running; connect is allowed
    Disconnected,
    /// Helper started, waiting for the tunnel to come up
    Connecting,
    /// Tunnel up and watched by the liveness monitor
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Connect attempt failed; left again for `Disconnected` once logged
    Error,
}

impl SessionState {
    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

/// Connect errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Config file not found: {0}")]
    ConfigFileNotFound(String),

    #[error("Elevation denied: {0}")]
    ElevationDenied(String),

    #[error("Remote authentication failed: {0}")]
    RemoteAuthFailed(String),

    #[error("Prerequisite not met: {0}")]
    PrerequisiteNotMet(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error(transparent)]
    Proxy(#[from] ProxyConfigError),
}

impl From<LaunchError> for ConnectError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::NotFound(program) => ConnectError::ExecutableNotFound(program),
            LaunchError::ElevationDenied(reason) => ConnectError::ElevationDenied(reason),
            LaunchError::Other(reason) => ConnectError::Launch(reason),
        }
    }
}

/// Collaborators handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub supervisor: Arc<dyn Supervisor>,
    pub proxy: Arc<ProxyController>,
    pub uplink: Arc<dyn UplinkProbe>,
    pub log: LogSink,
    pub settings: Arc<Settings>,
    /// Manager-wide connected signal
    pub connected: Arc<watch::Sender<bool>>,
}

/// Common lifecycle contract
#[async_trait]
pub trait BackendSession: Send {
    fn protocol(&self) -> Protocol;

    /// Copy the fields this backend uses; others are ignored
    fn apply_config(&mut self, config: &ProtocolConfig);

    fn export_config(&self) -> ProtocolConfig;

    fn state(&self) -> SessionState;

    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Best-effort teardown; always ends `Disconnected`
    async fn disconnect(&mut self);
}

/// State, log and proxy bookkeeping shared by all sessions
pub(crate) struct SessionCore {
    pub ctx: SessionContext,
    pub log: LogSink,
    pub state: SessionState,
    pub monitor: LivenessMonitor,
    guard: Option<ProxyGuard>,
}

impl SessionCore {
    pub fn new(ctx: SessionContext, protocol: Protocol) -> Self {
        let log = ctx.log.scoped(protocol.name());
        Self {
            ctx,
            log,
            state: SessionState::Disconnected,
            monitor: LivenessMonitor::new(),
            guard: None,
        }
    }

    pub fn begin_connect(&mut self) -> Result<(), ConnectError> {
        if self.state.is_active() {
            self.log.warn("Already connected");
            return Err(ConnectError::AlreadyConnected);
        }
        self.state = SessionState::Connecting;
        self.log.info("Connecting...");
        Ok(())
    }

    pub fn finish_connect(&mut self, result: Result<(), ConnectError>) -> Result<(), ConnectError> {
        match &result {
            Ok(()) => {
                self.state = SessionState::Connected;
                self.ctx.connected.send_replace(true);
                self.log.info("Connected");
            }
            Err(e) => {
                self.state = SessionState::Error;
                self.log.error(format!("Connection failed: {}", e));
                self.state = SessionState::Disconnected;
            }
        }
        result
    }

    /// Returns false (and logs) when there is nothing to tear down
    pub fn begin_disconnect(&mut self) -> bool {
        if self.state != SessionState::Connected {
            self.log.info("Not connected");
            return false;
        }
        self.state = SessionState::Disconnecting;
        self.log.info("Disconnecting...");
        true
    }

    pub fn finish_disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.ctx.connected.send_replace(false);
        self.log.info("Disconnected");
    }

    /// Wait out the settle delay and make sure the process survived it
    pub async fn settle(&self, handle: ProcessHandle, elevated: bool) -> Result<(), ConnectError> {
        tokio::time::sleep(self.ctx.settings.timing.settle()).await;

        match self.ctx.supervisor.status(handle) {
            ProcessStatus::Running => Ok(()),
            ProcessStatus::Exited(code) => {
                self.ctx.supervisor.terminate(handle).await;
                if elevated && is_elevation_denial(code) {
                    Err(ConnectError::ElevationDenied(format!(
                        "authorization refused (exit code {:?})",
                        code
                    )))
                } else {
                    Err(ConnectError::StartupFailed(format!(
                        "process exited with code {:?}",
                        code
                    )))
                }
            }
            ProcessStatus::Unknown => Err(ConnectError::StartupFailed("process lost".into())),
        }
    }

    /// Point the system proxy at a local port and arm the shutdown guard
    pub fn enable_proxy(&mut self, port: u16) -> Result<ProxyEndpoint, ConnectError> {
        let endpoint = ProxyEndpoint::new(self.ctx.settings.proxy.host.clone(), port);
        self.ctx.proxy.enable(endpoint.clone())?;
        self.log.info(format!("System proxy set to {}", endpoint));
        self.guard = Some(self.ctx.proxy.guard());
        Ok(endpoint)
    }

    /// Clear the system proxy; failures are logged, never raised
    pub fn disable_proxy(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        match self.ctx.proxy.disable() {
            Ok(()) => self.log.info("System proxy disabled"),
            Err(e) => self.log.error(format!("Failed to clear system proxy: {}", e)),
        }
    }

    /// Begin liveness polling for a confirmed connection
    pub fn watch<P, F>(&mut self, probe: P, on_transition: F)
    where
        P: Fn() -> bool + Send + Sync + 'static,
        F: Fn(Transition) + Send + Sync + 'static,
    {
        let interval = self.ctx.settings.timing.liveness_interval();
        self.monitor.start(probe, interval, true, on_transition);
    }
}

/// Path of a backend config file that must exist on disk
pub(crate) fn require_config_file(path: Option<&str>, what: &str) -> Result<String, ConnectError> {
    let path = path
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConnectError::InvalidSetting(format!("no {} selected", what)))?;

    if !Path::new(path).is_file() {
        return Err(ConnectError::ConfigFileNotFound(path.to_string()));
    }
    Ok(path.to_string())
}

/// Closed set of backends
pub enum Backend {
    OpenVpn(OpenVpnSession),
    WireGuard(WireGuardSession),
    Shadowsocks(LocalSocksSession),
    V2Ray(LocalSocksSession),
    Ssh(SshSession),
}

impl Backend {
    pub fn new(protocol: Protocol, ctx: SessionContext, connector: Arc<dyn SshConnector>) -> Self {
        match protocol {
            Protocol::OpenVpn => Backend::OpenVpn(OpenVpnSession::new(ctx)),
            Protocol::WireGuard => Backend::WireGuard(WireGuardSession::new(ctx)),
            Protocol::Shadowsocks => {
                Backend::Shadowsocks(LocalSocksSession::new(Protocol::Shadowsocks, ctx))
            }
            Protocol::V2Ray => Backend::V2Ray(LocalSocksSession::new(Protocol::V2Ray, ctx)),
            Protocol::Ssh => Backend::Ssh(SshSession::new(ctx, connector)),
        }
    }

    fn inner(&self) -> &dyn BackendSession {
        match self {
            Backend::OpenVpn(session) => session,
            Backend::WireGuard(session) => session,
            Backend::Shadowsocks(session) | Backend::V2Ray(session) => session,
            Backend::Ssh(session) => session,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn BackendSession {
        match self {
            Backend::OpenVpn(session) => session,
            Backend::WireGuard(session) => session,
            Backend::Shadowsocks(session) | Backend::V2Ray(session) => session,
            Backend::Ssh(session) => session,
        }
    }
}

#[async_trait]
impl BackendSession for Backend {
    fn protocol(&self) -> Protocol {
        self.inner().protocol()
    }

    fn apply_config(&mut self, config: &ProtocolConfig) {
        self.inner_mut().apply_config(config);
    }

    fn export_config(&self) -> ProtocolConfig {
        self.inner().export_config()
    }

    fn state(&self) -> SessionState {
        self.inner().state()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.inner_mut().connect().await
    }

    async fn disconnect(&mut self) {
        self.inner_mut().disconnect().await;
    }
}
