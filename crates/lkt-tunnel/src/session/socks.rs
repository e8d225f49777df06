//! Local SOCKS client backends (Shadowsocks, V2Ray)
//!
//! Both run a client process from a user-supplied JSON config and point
//! the system proxy at the port that config listens on. They differ only
//! in settings section and profile field.

use super::{BackendSession, ConnectError, SessionContext, SessionCore, SessionState, require_config_file};
use crate::config::{Protocol, ProtocolConfig};
use crate::process::{LaunchSpec, ProcessHandle};
use crate::settings::{SocksSettings, expand_args};
use async_trait::async_trait;

pub struct LocalSocksSession {
    protocol: Protocol,
    core: SessionCore,
    config_path: Option<String>,
    handle: Option<ProcessHandle>,
}

impl LocalSocksSession {
    /// `protocol` must be Shadowsocks or V2Ray
    pub fn new(protocol: Protocol, ctx: SessionContext) -> Self {
        debug_assert!(matches!(protocol, Protocol::Shadowsocks | Protocol::V2Ray));
        Self {
            protocol,
            core: SessionCore::new(ctx, protocol),
            config_path: None,
            handle: None,
        }
    }

    fn settings(&self) -> &SocksSettings {
        match self.protocol {
            Protocol::V2Ray => &self.core.ctx.settings.v2ray,
            _ => &self.core.ctx.settings.shadowsocks,
        }
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        let what = format!("{} config", self.protocol);
        let path = require_config_file(self.config_path.as_deref(), &what)?;
        let settings = self.settings().clone();

        let spec = LaunchSpec::new(
            settings.executable.clone(),
            expand_args(&settings.args, &[("config", &path)]),
        );
        self.core.log.info(format!("Starting {}", spec.display()));

        let supervisor = self.core.ctx.supervisor.clone();
        let handle = supervisor.start(&spec)?;
        supervisor.stream_output(handle, self.core.log.clone());
        self.core.settle(handle, false).await?;

        if let Err(e) = self.core.enable_proxy(settings.socks_port) {
            supervisor.terminate(handle).await;
            return Err(e);
        }
        self.handle = Some(handle);

        let probe_supervisor = supervisor.clone();
        let proxy = self.core.ctx.proxy.clone();
        let log = self.core.log.clone();
        let connected = self.core.ctx.connected.clone();
        let name = self.protocol.name();
        self.core.watch(
            move || probe_supervisor.is_running(handle),
            move |transition| {
                if !transition.is_loss() {
                    return;
                }
                log.warn(format!("{} process exited unexpectedly", name));
                match proxy.disable() {
                    Ok(()) => log.info("System proxy disabled"),
                    Err(e) => log.error(format!("Failed to clear system proxy: {}", e)),
                }
                connected.send_replace(false);
            },
        );
        Ok(())
    }
}

#[async_trait]
impl BackendSession for LocalSocksSession {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn apply_config(&mut self, config: &ProtocolConfig) {
        self.config_path = match self.protocol {
            Protocol::V2Ray => config.v2ray_config_path.clone(),
            _ => config.shadow_socks_config_path.clone(),
        };
    }

    fn export_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::new(self.protocol);
        match self.protocol {
            Protocol::V2Ray => config.v2ray_config_path = self.config_path.clone(),
            _ => config.shadow_socks_config_path = self.config_path.clone(),
        }
        config
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
            if let Some(handle) = self.handle.take() {
                self.core.ctx.supervisor.terminate(handle).await;
            }
        }

        self.core.disable_proxy();

        if active {
            self.core.finish_disconnect();
        }
    }
}
