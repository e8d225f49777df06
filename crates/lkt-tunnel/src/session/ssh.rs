//! SSH dynamic forward backend
//!
//! Opens `ssh -D` through an already-live VPN uplink and points the
//! system proxy at the forward. Losing the uplink clears the proxy but
//! keeps the SSH session; regaining it restores the proxy. If the `ssh`
//! process itself exits, the proxy is cleared and the connected signal
//! drops.

use super::{BackendSession, ConnectError, SessionContext, SessionCore, SessionState};
use crate::config::{Protocol, ProtocolConfig};
use crate::log::LogSink;
use crate::process::{LaunchSpec, ProcessHandle, ProcessStatus, Supervisor};
use crate::settings::expand_args;
use async_trait::async_trait;
use std::sync::Arc;

const DEFAULT_SSH_PORT: u16 = 22;

/// sshpass: invalid password
const SSHPASS_AUTH_FAILED: i32 = 5;
/// ssh: connection or authentication error
const SSH_ERROR: i32 = 255;

/// Where and how to log in
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Local SOCKS port of the dynamic forward
    pub local_port: u16,
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Shareable "is the forward still up?" check
pub type TunnelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// An open SSH session with a dynamic forward
#[async_trait]
pub trait RemoteTunnel: Send + Sync {
    fn local_port(&self) -> u16;

    /// Check that outlives `&self`, for the liveness monitor
    fn open_check(&self) -> TunnelCheck;

    fn is_open(&self) -> bool {
        (self.open_check())()
    }

    async fn close(&mut self);
}

/// Produces remote sessions
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn open(
        &self,
        target: &SshTarget,
        ctx: &SessionContext,
        log: &LogSink,
    ) -> Result<Box<dyn RemoteTunnel>, ConnectError>;
}

/// Supervises the OpenSSH client
#[derive(Debug, Default)]
pub struct OpenSshConnector;

impl OpenSshConnector {
    fn launch_spec(target: &SshTarget, ctx: &SessionContext) -> LaunchSpec {
        let settings = &ctx.settings.ssh;
        let port = target.port.to_string();
        let local_port = target.local_port.to_string();
        let ssh_args = expand_args(
            &settings.args,
            &[
                ("host", &target.host),
                ("port", &port),
                ("user", &target.username),
                ("local_port", &local_port),
            ],
        );

        match &target.password {
            Some(password) => {
                let wrapper = &settings.password_wrapper;
                let mut args = wrapper.args.clone();
                args.push(settings.executable.clone());
                args.extend(ssh_args);
                LaunchSpec::new(wrapper.program.clone(), args).env("SSHPASS", password.clone())
            }
            None => LaunchSpec::new(settings.executable.clone(), ssh_args),
        }
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn open(
        &self,
        target: &SshTarget,
        ctx: &SessionContext,
        log: &LogSink,
    ) -> Result<Box<dyn RemoteTunnel>, ConnectError> {
        let spec = Self::launch_spec(target, ctx);
        log.info(format!(
            "Opening SSH forward {}@{}:{} on local port {}",
            target.username, target.host, target.port, target.local_port
        ));

        let supervisor = ctx.supervisor.clone();
        let handle = supervisor.start(&spec)?;
        supervisor.stream_output(handle, log.clone());
        tokio::time::sleep(ctx.settings.timing.settle()).await;

        match supervisor.status(handle) {
            ProcessStatus::Running => Ok(Box::new(OpenSshTunnel {
                supervisor,
                handle,
                local_port: target.local_port,
            })),
            ProcessStatus::Exited(code) => {
                supervisor.terminate(handle).await;
                match code {
                    Some(SSH_ERROR) | Some(SSHPASS_AUTH_FAILED) => {
                        Err(ConnectError::RemoteAuthFailed(format!(
                            "{}@{} rejected the login (exit code {:?})",
                            target.username, target.host, code
                        )))
                    }
                    _ => Err(ConnectError::StartupFailed(format!(
                        "ssh exited with code {:?}",
                        code
                    ))),
                }
            }
            ProcessStatus::Unknown => Err(ConnectError::StartupFailed("ssh process lost".into())),
        }
    }
}

struct OpenSshTunnel {
    supervisor: Arc<dyn Supervisor>,
    handle: ProcessHandle,
    local_port: u16,
}

#[async_trait]
impl RemoteTunnel for OpenSshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn open_check(&self) -> TunnelCheck {
        let supervisor = self.supervisor.clone();
        let handle = self.handle;
        Arc::new(move || supervisor.is_running(handle))
    }

    async fn close(&mut self) {
        self.supervisor.terminate(self.handle).await;
    }
}

pub struct SshSession {
    core: SessionCore,
    connector: Arc<dyn SshConnector>,
    host: Option<String>,
    port: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tunnel: Option<Box<dyn RemoteTunnel>>,
}

impl SshSession {
    pub fn new(ctx: SessionContext, connector: Arc<dyn SshConnector>) -> Self {
        Self {
            core: SessionCore::new(ctx, Protocol::Ssh),
            connector,
            host: None,
            port: None,
            username: None,
            password: None,
            tunnel: None,
        }
    }

    fn target(&self) -> Result<SshTarget, ConnectError> {
        let host = non_empty(&self.host)
            .ok_or_else(|| ConnectError::InvalidSetting("no SSH host".into()))?;
        let username = non_empty(&self.username)
            .ok_or_else(|| ConnectError::InvalidSetting("no SSH username".into()))?;
        for (what, value) in [("host", &host), ("username", &username)] {
            if value.starts_with('-') {
                return Err(ConnectError::InvalidSetting(format!(
                    "SSH {} may not start with '-'",
                    what
                )));
            }
        }
        let port = match non_empty(&self.port) {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConnectError::InvalidSetting(format!("bad SSH port '{}'", port)))?,
            None => DEFAULT_SSH_PORT,
        };

        Ok(SshTarget {
            host,
            port,
            username,
            password: non_empty(&self.password),
            local_port: self.core.ctx.settings.ssh.local_port,
        })
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        let uplink = self.core.ctx.uplink.clone();
        let live = tokio::task::spawn_blocking(move || uplink.is_uplink_live())
            .await
            .unwrap_or(false);
        if !live {
            return Err(ConnectError::PrerequisiteNotMet(
                "no VPN uplink is active; connect a VPN first".into(),
            ));
        }

        let target = self.target()?;
        let mut tunnel = self
            .connector
            .open(&target, &self.core.ctx, &self.core.log)
            .await?;

        let endpoint = match self.core.enable_proxy(tunnel.local_port()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tunnel.close().await;
                return Err(e);
            }
        };
        let tunnel_open = tunnel.open_check();
        self.tunnel = Some(tunnel);

        let probe_open = tunnel_open.clone();
        let uplink = self.core.ctx.uplink.clone();
        let proxy = self.core.ctx.proxy.clone();
        let connected = self.core.ctx.connected.clone();
        let log = self.core.log.clone();
        self.core.watch(
            move || probe_open() && uplink.is_uplink_live(),
            move |transition| {
                if transition.is_loss() && !tunnel_open() {
                    log.warn("SSH session closed unexpectedly");
                    match proxy.disable() {
                        Ok(()) => log.info("System proxy disabled"),
                        Err(e) => log.error(format!("Failed to clear system proxy: {}", e)),
                    }
                    connected.send_replace(false);
                } else if transition.is_loss() {
                    match proxy.disable() {
                        Ok(()) => log.warn("VPN uplink lost; system proxy disabled"),
                        Err(e) => log.error(format!(
                            "VPN uplink lost; failed to clear system proxy: {}",
                            e
                        )),
                    }
                } else {
                    match proxy.enable(endpoint.clone()) {
                        Ok(()) => log.info(format!("VPN uplink back; system proxy set to {}", endpoint)),
                        Err(e) => log.error(format!(
                            "VPN uplink back; failed to restore system proxy: {}",
                            e
                        )),
                    }
                }
            },
        );
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl BackendSession for SshSession {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    fn apply_config(&mut self, config: &ProtocolConfig) {
        self.host = config.ssh_host.clone();
        self.port = config.ssh_port.clone();
        self.username = config.ssh_username.clone();
        self.password = config.ssh_password.clone();
    }

    fn export_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            ssh_host: self.host.clone(),
            ssh_port: self.port.clone(),
            ssh_username: self.username.clone(),
            ssh_password: self.password.clone(),
            ..ProtocolConfig::new(Protocol::Ssh)
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
        let active = self.core.begin_disconnect();
        if active {
            self.core.monitor.shutdown().await;
            if let Some(mut tunnel) = self.tunnel.take() {
                if !tunnel.is_open() {
                    self.core.log.warn("SSH session had already closed");
                }
                tunnel.close().await;
            }
        }

        self.core.disable_proxy();

        if active {
            self.core.finish_disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyEndpoint;
    use crate::testing::{FakeConnector, Harness};
    use std::time::Duration;

    fn ssh_config() -> ProtocolConfig {
        let mut config = ProtocolConfig::new(Protocol::Ssh);
        config.ssh_host = Some("gate.example.org".into());
        config.ssh_port = Some("2222".into());
        config.ssh_username = Some("ops".into());
        config.ssh_password = Some("s3cret".into());
        config
    }

    fn session(harness: &Harness, connector: &Arc<FakeConnector>) -> SshSession {
        let mut session = SshSession::new(harness.context(), connector.clone());
        session.apply_config(&ssh_config());
        session
    }

    #[tokio::test]
    async fn test_no_uplink_is_prerequisite_failure() {
        let harness = Harness::new();
        harness.uplink.set(false);
        let connector = Arc::new(FakeConnector::new());
        let mut session = session(&harness, &connector);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::PrerequisiteNotMet(_))
        ));
        assert_eq!(connector.opened().len(), 0);
        assert!(harness.proxy_store.history().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_enables_proxy_at_forward_port() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());
        let mut session = session(&harness, &connector);

        session.connect().await.unwrap();

        let opened = connector.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].port, 2222);
        assert_eq!(opened[0].password.as_deref(), Some("s3cret"));
        assert_eq!(
            harness.proxy.current(),
            Some(ProxyEndpoint::new("127.0.0.1", 1080))
        );

        session.disconnect().await;
        assert_eq!(connector.closed(), 1);
        assert!(!harness.proxy_store.is_enabled());
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::failing(ConnectError::RemoteAuthFailed(
            "denied".into(),
        )));
        let mut session = session(&harness, &connector);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::RemoteAuthFailed(_))
        ));
        assert!(harness.proxy_store.history().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_port() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());
        let mut session = SshSession::new(harness.context(), connector.clone());
        let mut config = ssh_config();
        config.ssh_port = Some("ssh".into());
        session.apply_config(&config);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::InvalidSetting(_))
        ));
        assert!(connector.opened().is_empty());
    }

    #[tokio::test]
    async fn test_option_like_target_rejected() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());

        for (host, user) in [("-oProxyCommand=sh", "ops"), ("gate.example.org", "-F/tmp/x")] {
            let mut session = SshSession::new(harness.context(), connector.clone());
            let mut config = ssh_config();
            config.ssh_host = Some(host.into());
            config.ssh_username = Some(user.into());
            session.apply_config(&config);

            assert!(matches!(
                session.connect().await,
                Err(ConnectError::InvalidSetting(_))
            ));
        }
        assert!(connector.opened().is_empty());
    }

    #[tokio::test]
    async fn test_default_port_and_no_password() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());
        let mut session = SshSession::new(harness.context(), connector.clone());
        let mut config = ssh_config();
        config.ssh_port = None;
        config.ssh_password = Some(String::new());
        session.apply_config(&config);

        session.connect().await.unwrap();
        assert_eq!(connector.opened()[0].port, 22);
        assert_eq!(connector.opened()[0].password, None);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_uplink_loss_and_regain() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());
        let mut session = session(&harness, &connector);
        session.connect().await.unwrap();

        harness.uplink.set(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!harness.proxy_store.is_enabled());
        assert_eq!(connector.closed(), 0);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(harness.log_text().contains("VPN uplink lost"));

        harness.uplink.set(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.proxy_store.is_enabled());
        assert!(harness.log_text().contains("VPN uplink back"));

        session.disconnect().await;
        assert!(!harness.proxy_store.is_enabled());
    }

    #[tokio::test]
    async fn test_forward_exit_clears_proxy() {
        let harness = Harness::new();
        let mut session = SshSession::new(harness.context(), Arc::new(OpenSshConnector));
        session.apply_config(&ssh_config());
        let connected = harness.connected.subscribe();

        session.connect().await.unwrap();
        assert!(harness.proxy_store.is_enabled());
        assert!(*connected.borrow());

        harness.supervisor.crash_all();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!harness.proxy_store.is_enabled());
        assert!(!*connected.borrow());
        assert!(harness.log_text().contains("SSH session closed unexpectedly"));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_fake_forward_drop_clears_proxy() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());
        let mut session = session(&harness, &connector);
        session.connect().await.unwrap();

        connector.drop_tunnels();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!harness.proxy_store.is_enabled());
        assert!(harness.log_text().contains("SSH session closed unexpectedly"));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_dropped_session_clears_proxy() {
        let harness = Harness::new();
        let connector = Arc::new(FakeConnector::new());
        let mut session = session(&harness, &connector);
        session.connect().await.unwrap();
        assert!(harness.proxy_store.is_enabled());

        drop(session);
        assert!(!harness.proxy_store.is_enabled());
    }

    #[test]
    fn test_launch_spec_with_password() {
        let harness = Harness::new();
        let ctx = harness.context();
        let target = SshTarget {
            host: "gate.example.org".into(),
            port: 2222,
            username: "ops".into(),
            password: Some("s3cret".into()),
            local_port: 1080,
        };

        let spec = OpenSshConnector::launch_spec(&target, &ctx);
        assert_eq!(spec.program, "sshpass");
        assert_eq!(spec.args[..2], ["-e", "ssh"]);
        assert!(spec.args.contains(&"127.0.0.1:1080".to_string()));
        let destination = spec
            .args
            .iter()
            .position(|arg| arg == "ops@gate.example.org")
            .unwrap();
        assert_eq!(spec.args[destination - 1], "--");
        assert!(!spec.display().contains("s3cret"));
        assert_eq!(spec.env, [("SSHPASS".to_string(), "s3cret".to_string())]);
    }

    #[test]
    fn test_launch_spec_without_password() {
        let harness = Harness::new();
        let ctx = harness.context();
        let target = SshTarget {
            host: "gate.example.org".into(),
            port: 22,
            username: "ops".into(),
            password: None,
            local_port: 1080,
        };

        let spec = OpenSshConnector::launch_spec(&target, &ctx);
        assert_eq!(spec.program, "ssh");
        assert!(spec.env.is_empty());
    }

    #[tokio::test]
    async fn test_openssh_exit_255_is_auth_failure() {
        let harness = Harness::new();
        harness.supervisor.exit_on_start(Some(255));
        let target = SshTarget {
            host: "gate.example.org".into(),
            port: 22,
            username: "ops".into(),
            password: None,
            local_port: 1080,
        };

        let result = OpenSshConnector.open(&target, &harness.context(), &harness.log()).await;
        assert!(matches!(result, Err(ConnectError::RemoteAuthFailed(_))));
        assert_eq!(harness.supervisor.terminated().len(), 1);
    }

    #[tokio::test]
    async fn test_openssh_running_tunnel() {
        let harness = Harness::new();
        let target = SshTarget {
            host: "gate.example.org".into(),
            port: 22,
            username: "ops".into(),
            password: None,
            local_port: 1081,
        };

        let mut tunnel = OpenSshConnector
            .open(&target, &harness.context(), &harness.log())
            .await
            .unwrap();
        assert_eq!(tunnel.local_port(), 1081);
        assert!(tunnel.is_open());

        tunnel.close().await;
        assert!(!tunnel.is_open());
    }
}
