//! Tunnel Session Manager
//!
//! Owns one session per protocol, routes calls to the selected one and
//! publishes the connected signal. At most one backend is active at a
//! time; every session-mutating call goes through a single async mutex.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (manager, mut logs) = TunnelSessionManager::system(Settings::default());
//! manager.import_file(Path::new("office.lktconf"), || None).await?;
//! manager.connect(Protocol::WireGuard).await?;
//!
//! while let Some(entry) = logs.recv().await {
//!     println!("{}", entry);
//! }
//! ```

use crate::codec::{CodecError, ConfigCodec};
use crate::config::{ConfigError, Protocol, ProtocolConfig};
use crate::log::{self, LOG_CAPACITY, LogSink, LogStream};
use crate::process::{ProcessSupervisor, Supervisor};
use crate::proxy::{ProxyController, ProxyStore, platform_store};
use crate::session::{
    Backend, BackendSession, ConnectError, OpenSshConnector, SessionContext, SessionState,
    SshConnector,
};
use crate::settings::Settings;
use crate::uplink::{InterfaceUplinkProbe, UplinkProbe};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

/// Manager errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("{active} is active; disconnect it first")]
    Busy { active: Protocol },

    #[error("No protocol selected")]
    NothingSelected,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct Sessions {
    backends: HashMap<Protocol, Backend>,
    selected: Option<Protocol>,
}

impl Sessions {
    /// Protocol of a backend that is not fully disconnected
    fn active(&self) -> Option<Protocol> {
        Protocol::all().iter().copied().find(|protocol| {
            self.backends
                .get(protocol)
                .is_some_and(|backend| backend.state() != SessionState::Disconnected)
        })
    }

    fn select(&mut self, protocol: Protocol) -> Result<&mut Backend, ManagerError> {
        if let Some(active) = self.active().filter(|active| *active != protocol) {
            return Err(ManagerError::Busy { active });
        }
        if self.selected != Some(protocol) {
            debug!("Selected {}", protocol);
            self.selected = Some(protocol);
        }
        self.backend(protocol)
    }

    fn backend(&mut self, protocol: Protocol) -> Result<&mut Backend, ManagerError> {
        self.backends
            .get_mut(&protocol)
            .ok_or(ManagerError::Config(ConfigError::UnknownProtocol(protocol.to_string())))
    }
}

/// Top-level orchestrator
pub struct TunnelSessionManager {
    sessions: Mutex<Sessions>,
    proxy: Arc<ProxyController>,
    connected: Arc<watch::Sender<bool>>,
    log: LogSink,
}

impl TunnelSessionManager {
    /// OS supervisor, platform proxy store, interface-table uplink, OpenSSH
    pub fn system(settings: Settings) -> (Self, LogStream) {
        let supervisor = Arc::new(ProcessSupervisor::new(
            settings.elevation.clone(),
            settings.timing.terminate(),
        ));
        Self::new(settings, supervisor, platform_store())
    }

    pub fn new(
        settings: Settings,
        supervisor: Arc<dyn Supervisor>,
        proxy_store: Arc<dyn ProxyStore>,
    ) -> (Self, LogStream) {
        let uplink = Arc::new(InterfaceUplinkProbe::new(&settings.ssh.uplink_keywords));
        Self::with_collaborators(
            settings,
            supervisor,
            proxy_store,
            uplink,
            Arc::new(OpenSshConnector),
        )
    }

    pub fn with_collaborators(
        settings: Settings,
        supervisor: Arc<dyn Supervisor>,
        proxy_store: Arc<dyn ProxyStore>,
        uplink: Arc<dyn UplinkProbe>,
        connector: Arc<dyn SshConnector>,
    ) -> (Self, LogStream) {
        let (log, stream) = log::channel(LOG_CAPACITY);
        let (connected, _) = watch::channel(false);
        let connected = Arc::new(connected);
        let proxy = Arc::new(ProxyController::new(proxy_store));

        let ctx = SessionContext {
            supervisor,
            proxy: proxy.clone(),
            uplink,
            log: log.clone(),
            settings: Arc::new(settings),
            connected: connected.clone(),
        };
        let backends = Protocol::all()
            .iter()
            .map(|protocol| {
                (
                    *protocol,
                    Backend::new(*protocol, ctx.clone(), connector.clone()),
                )
            })
            .collect();

        let manager = Self {
            sessions: Mutex::new(Sessions {
                backends,
                selected: None,
            }),
            proxy,
            connected,
            log,
        };
        (manager, stream)
    }

    /// Make `protocol` the current backend
    ///
    /// Fails with `Busy` while a different backend is not disconnected.
    pub async fn select(&self, protocol: Protocol) -> Result<(), ManagerError> {
        self.sessions.lock().await.select(protocol).map(|_| ())
    }

    pub async fn selected(&self) -> Option<Protocol> {
        self.sessions.lock().await.selected
    }

    /// Backend that is currently not disconnected, if any
    pub async fn active(&self) -> Option<Protocol> {
        self.sessions.lock().await.active()
    }

    /// State of the selected backend
    pub async fn state(&self) -> SessionState {
        let mut sessions = self.sessions.lock().await;
        match sessions.selected {
            Some(protocol) => sessions
                .backend(protocol)
                .map(|backend| backend.state())
                .unwrap_or(SessionState::Disconnected),
            None => SessionState::Disconnected,
        }
    }

    pub async fn connect(&self, protocol: Protocol) -> Result<(), ManagerError> {
        let mut sessions = self.sessions.lock().await;
        let backend = sessions.select(protocol)?;
        backend.connect().await?;
        Ok(())
    }

    /// Run the backend's disconnect; never fails
    pub async fn disconnect(&self, protocol: Protocol) {
        let mut sessions = self.sessions.lock().await;
        if let Ok(backend) = sessions.backend(protocol) {
            backend.disconnect().await;
        }
    }

    /// Select the config's backend and hand it the config
    pub async fn apply_config(&self, config: &ProtocolConfig) -> Result<(), ManagerError> {
        let protocol = config.require_protocol()?;
        let mut sessions = self.sessions.lock().await;
        sessions.select(protocol)?.apply_config(config);
        self.log.info(format!("Loaded {} configuration", protocol));
        Ok(())
    }

    /// Config of the selected backend
    pub async fn export_config(&self) -> Result<ProtocolConfig, ManagerError> {
        let mut sessions = self.sessions.lock().await;
        let protocol = sessions.selected.ok_or(ManagerError::NothingSelected)?;
        Ok(sessions.backend(protocol)?.export_config())
    }

    /// Import a profile and apply it; nothing changes if decoding fails
    pub async fn import_file<F>(&self, path: &Path, passphrase: F) -> Result<Protocol, ManagerError>
    where
        F: FnOnce() -> Option<String>,
    {
        let config = match ConfigCodec::import_file(path, passphrase) {
            Ok(config) => config,
            Err(e) => {
                self.log.error(format!("Import of {} failed: {}", path.display(), e));
                return Err(e.into());
            }
        };
        self.apply_config(&config).await?;
        self.log.info(format!("Imported {}", path.display()));
        config.require_protocol().map_err(ManagerError::from)
    }

    /// Export the selected backend's config, locked when a passphrase is given
    pub async fn export_file(&self, path: &Path, passphrase: Option<&str>) -> Result<(), ManagerError> {
        let config = self.export_config().await?;
        ConfigCodec::export_file(path, &config, passphrase)?;
        self.log.info(format!(
            "Exported {} configuration to {}{}",
            config.protocol.map(|p| p.name()).unwrap_or("unknown"),
            path.display(),
            if passphrase.is_some() { " (locked)" } else { "" }
        ));
        Ok(())
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Disconnect whatever is active and make sure the proxy is cleared
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        if let Some(active) = sessions.active() {
            info!("Shutting down {}", active);
            if let Ok(backend) = sessions.backend(active) {
                backend.disconnect().await;
            }
        }

        if self.proxy.current().is_some() {
            if let Err(e) = self.proxy.disable() {
                self.log.error(format!("Failed to clear system proxy: {}", e));
            }
        }
    }
}
