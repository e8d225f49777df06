//! OpenVPN backend: one elevated client process per connection.

use super::{BackendSession, ConnectError, SessionContext, SessionCore, SessionState, require_config_file};
use crate::config::{Protocol, ProtocolConfig};
use crate::process::{LaunchSpec, ProcessHandle};
use crate::settings::expand_args;
use async_trait::async_trait;

pub struct OpenVpnSession {
    core: SessionCore,
    config_path: Option<String>,
    handle: Option<ProcessHandle>,
}

impl OpenVpnSession {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            core: SessionCore::new(ctx, Protocol::OpenVpn),
            config_path: None,
            handle: None,
        }
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        let path = require_config_file(self.config_path.as_deref(), "OpenVPN config")?;
        let ctx = self.core.ctx.clone();
        let settings = &ctx.settings.openvpn;

        let spec = LaunchSpec::new(
            settings.executable.clone(),
            expand_args(&settings.args, &[("config", &path)]),
        )
        .elevated(true);
        self.core.log.info(format!("Starting {}", spec.display()));

        let handle = ctx.supervisor.start(&spec)?;
        ctx.supervisor.stream_output(handle, self.core.log.clone());
        self.core.settle(handle, true).await?;
        self.handle = Some(handle);

        let supervisor = ctx.supervisor.clone();
        let process_name = settings.process_name.clone();
        let log = self.core.log.clone();
        let connected = ctx.connected.clone();
        self.core.watch(
            move || {
                supervisor
                    .find_by_name(&process_name)
                    .is_ok_and(|pids| !pids.is_empty())
            },
            move |transition| {
                if transition.is_loss() {
                    log.warn("OpenVPN process is no longer running");
                    connected.send_replace(false);
                } else {
                    log.info("OpenVPN process is running again");
                    connected.send_replace(true);
                }
            },
        );
        Ok(())
    }
}

impl OpenVpnSession {
    /// Kill OpenVPN clients this session did not start
    async fn kill_leftovers(&self) {
        let supervisor = &self.core.ctx.supervisor;
        let process_name = &self.core.ctx.settings.openvpn.process_name;
        if !supervisor
            .find_by_name(process_name)
            .is_ok_and(|pids| !pids.is_empty())
        {
            return;
        }

        self.core.log.warn("Leftover OpenVPN process found; killing it");
        match supervisor.kill_by_name(process_name).await {
            Ok(count) => self
                .core
                .log
                .info(format!("Killed {} OpenVPN process(es)", count)),
            Err(e) => self.core.log.error(format!(
                "Could not kill leftover OpenVPN process ({}); the tunnel might still be up",
                e
            )),
        }
    }
}

#[async_trait]
impl BackendSession for OpenVpnSession {
    fn protocol(&self) -> Protocol {
        Protocol::OpenVpn
    }

    fn apply_config(&mut self, config: &ProtocolConfig) {
        self.config_path = config.open_vpn_config_path.clone();
    }

    fn export_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            open_vpn_config_path: self.config_path.clone(),
            ..ProtocolConfig::new(Protocol::OpenVpn)
        }
    }

    fn state(&self) -> SessionState {
        self.core.state
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.core.begin_connect()?;
        let result = self.establish().await;
        self.core.finish_connect(result)
    }

    async fn disconnect(&mut self) {
        if !self.core.begin_disconnect() {
            self.kill_leftovers().await;
            return;
        }
        self.core.monitor.shutdown().await;

        if let Some(handle) = self.handle.take() {
            self.core.ctx.supervisor.terminate(handle).await;
        }

        let process_name = &self.core.ctx.settings.openvpn.process_name;
        if self
            .core
            .ctx
            .supervisor
            .find_by_name(process_name)
            .is_ok_and(|pids| !pids.is_empty())
        {
            self.core
                .log
                .warn("An OpenVPN process is still running; the tunnel might still be up");
        }
        self.core.finish_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{LaunchError, Supervisor};
    use crate::testing::Harness;
    use std::time::Duration;

    fn session(harness: &Harness, file: &tempfile::NamedTempFile) -> OpenVpnSession {
        let mut session = OpenVpnSession::new(harness.context());
        let mut config = ProtocolConfig::new(Protocol::OpenVpn);
        config.open_vpn_config_path = Some(file.path().to_string_lossy().into_owned());
        session.apply_config(&config);
        session
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let harness = Harness::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);
        let connected = harness.connected.subscribe();

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(*connected.borrow());

        let started = harness.supervisor.started();
        assert_eq!(started.len(), 1);
        assert!(started[0].elevated);
        assert!(started[0].args.contains(&file.path().to_string_lossy().into_owned()));
        assert!(started[0].args.contains(&"--auth-nocache".to_string()));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(harness.supervisor.terminated().len(), 1);
        assert!(!*connected.borrow());
        assert!(harness.proxy_store.history().is_empty());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let harness = Harness::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);

        session.connect().await.unwrap();
        assert_eq!(session.connect().await, Err(ConnectError::AlreadyConnected));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(harness.supervisor.started().len(), 1);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let harness = Harness::new();
        let mut session = OpenVpnSession::new(harness.context());
        let mut config = ProtocolConfig::new(Protocol::OpenVpn);
        config.open_vpn_config_path = Some("/no/such/office.ovpn".into());
        session.apply_config(&config);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::ConfigFileNotFound(_))
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(harness.supervisor.started().is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let harness = Harness::new();
        harness.supervisor.missing("openvpn");
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);

        assert_eq!(
            session.connect().await,
            Err(ConnectError::ExecutableNotFound("openvpn".into()))
        );
        assert!(harness.log_text().contains("Connection failed"));
    }

    #[tokio::test]
    async fn test_elevation_refused() {
        let harness = Harness::new();
        harness.supervisor.exit_on_start(Some(126));
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::ElevationDenied(_))
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_early_exit() {
        let harness = Harness::new();
        harness.supervisor.exit_on_start(Some(1));
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::StartupFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_start_launch_error() {
        let harness = Harness::new();
        harness
            .supervisor
            .fail_start(LaunchError::ElevationDenied("pkexec dismissed".into()));
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);

        assert_eq!(
            session.connect().await,
            Err(ConnectError::ElevationDenied("pkexec dismissed".into()))
        );
    }

    #[tokio::test]
    async fn test_process_loss_reported() {
        let harness = Harness::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);
        let connected = harness.connected.subscribe();

        session.connect().await.unwrap();
        harness.supervisor.crash_all();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!*connected.borrow());
        assert!(harness.log_text().contains("no longer running"));
        assert_eq!(session.state(), SessionState::Connected);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_kills_leftover_client() {
        let harness = Harness::new();
        harness.supervisor.spawn_named("openvpn");
        let mut session = OpenVpnSession::new(harness.context());

        session.disconnect().await;

        assert_eq!(harness.supervisor.killed(), ["openvpn"]);
        assert!(harness.supervisor.find_by_name("openvpn").unwrap().is_empty());
        let log = harness.log_text();
        assert!(log.contains("Not connected"));
        assert!(log.contains("Killed 1 OpenVPN process(es)"));
    }

    #[tokio::test]
    async fn test_double_disconnect() {
        let harness = Harness::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut session = session(&harness, &file);

        session.connect().await.unwrap();
        session.disconnect().await;
        harness.log_text();
        session.disconnect().await;

        assert!(harness.log_text().contains("Not connected"));
        assert_eq!(harness.supervisor.terminated().len(), 1);
    }
}
