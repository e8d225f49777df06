//! WireGuard backend
//!
//! The tunnel runs as an OS service (`wireguard.exe /installtunnelservice`
//! or `wg-quick up`); the session only installs and removes it. The
//! tunnel name is the config file stem, which is also the interface name.
//!
//! Disconnect falls back through three tiers, logging each one:
//!
//! 1. service uninstall command
//! 2. kill the helper processes by name
//! 3. disable the network interface
//!
//! A disconnect on a session that never connected still looks for a
//! tunnel or helper left behind by an earlier run and removes it.

use super::{BackendSession, ConnectError, SessionContext, SessionCore, SessionState, require_config_file};
use crate::config::{Protocol, ProtocolConfig};
use crate::process::{LaunchError, LaunchSpec, RunStatus, is_elevation_denial};
use crate::settings::{WireGuardLiveness, expand_args};
use crate::uplink::interface_exists;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

type Probe = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct WireGuardSession {
    core: SessionCore,
    config_path: Option<String>,
    /// Installed tunnel name while connected
    tunnel: Option<String>,
}

/// Tunnel name used by both wireguard.exe and wg-quick
pub fn tunnel_name(config_path: &str) -> String {
    Path::new(config_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| config_path.to_string())
}

impl WireGuardSession {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            core: SessionCore::new(ctx, Protocol::WireGuard),
            config_path: None,
            tunnel: None,
        }
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        let path = require_config_file(self.config_path.as_deref(), "WireGuard config")?;
        let tunnel = tunnel_name(&path);
        let ctx = self.core.ctx.clone();
        let settings = &ctx.settings.wireguard;

        let spec = LaunchSpec::new(
            settings.executable.clone(),
            expand_args(&settings.install_args, &vars(&path, &tunnel)),
        )
        .elevated(true);
        self.core.log.info(format!("Installing tunnel service: {}", spec.display()));

        match ctx
            .supervisor
            .run(&spec, ctx.settings.timing.command_timeout(), &self.core.log)
            .await?
        {
            RunStatus::Success => {}
            RunStatus::Failed(code) if is_elevation_denial(code) => {
                return Err(ConnectError::ElevationDenied(format!(
                    "authorization refused (exit code {:?})",
                    code
                )));
            }
            RunStatus::Failed(code) => {
                return Err(ConnectError::StartupFailed(format!(
                    "tunnel service install exited with code {:?}",
                    code
                )));
            }
            RunStatus::TimedOut => {
                return Err(ConnectError::StartupFailed(
                    "tunnel service install timed out".into(),
                ));
            }
        }

        tokio::time::sleep(ctx.settings.timing.settle()).await;

        let probe = self.probe(&tunnel);
        let check = probe.clone();
        let alive = tokio::task::spawn_blocking(move || check())
            .await
            .unwrap_or(false);
        if !alive {
            if let Err(e) = self.uninstall(&path, &tunnel).await {
                self.core.log.warn(format!("Cleanup after failed start: {}", e));
            }
            return Err(ConnectError::StartupFailed(format!(
                "tunnel {} did not come up",
                tunnel
            )));
        }

        self.core.log.info(format!("Tunnel {} is up", tunnel));
        self.tunnel = Some(tunnel.clone());

        let log = self.core.log.clone();
        let connected = ctx.connected.clone();
        self.core.watch(
            move || probe(),
            move |transition| {
                if transition.is_loss() {
                    log.warn(format!("Tunnel {} went down", tunnel));
                    connected.send_replace(false);
                } else {
                    log.info(format!("Tunnel {} is back up", tunnel));
                    connected.send_replace(true);
                }
            },
        );
        Ok(())
    }

    fn probe(&self, tunnel: &str) -> Probe {
        match self.core.ctx.settings.wireguard.liveness {
            WireGuardLiveness::Process => self.helper_probe(),
            WireGuardLiveness::Interface => {
                let tunnel = tunnel.to_string();
                Arc::new(move || interface_exists(&tunnel))
            }
        }
    }

    fn helper_probe(&self) -> Probe {
        let supervisor = self.core.ctx.supervisor.clone();
        let names = self.core.ctx.settings.wireguard.helper_names.clone();
        Arc::new(move || {
            names.iter().any(|name| {
                supervisor
                    .find_by_name(name)
                    .is_ok_and(|pids| !pids.is_empty())
            })
        })
    }

    /// Remove a tunnel or helper this session did not start
    async fn clean_leftovers(&mut self) {
        let tunnel = self
            .config_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(tunnel_name);

        let probe = match &tunnel {
            Some(tunnel) => self.probe(tunnel),
            None => self.helper_probe(),
        };
        let found = tokio::task::spawn_blocking(move || probe())
            .await
            .unwrap_or(false);
        if !found {
            return;
        }

        match tunnel {
            Some(tunnel) => {
                self.core
                    .log
                    .warn(format!("Leftover tunnel {} found; removing it", tunnel));
                self.teardown(&tunnel).await;
            }
            None => {
                self.core.log.warn("Leftover WireGuard processes found");
                match self.kill_helpers().await {
                    Ok(count) => self
                        .core
                        .log
                        .info(format!("Killed {} WireGuard process(es)", count)),
                    Err(e) => self.core.log.error(format!("Process kill failed: {}", e)),
                }
            }
        }
    }

    /// Tier 1
    async fn uninstall(&self, path: &str, tunnel: &str) -> Result<(), String> {
        let settings = &self.core.ctx.settings.wireguard;
        let spec = LaunchSpec::new(
            settings.executable.clone(),
            expand_args(&settings.uninstall_args, &vars(path, tunnel)),
        )
        .elevated(true);
        self.run_checked(&spec).await
    }

    /// Tier 2
    async fn kill_helpers(&self) -> Result<usize, String> {
        let mut killed = 0;
        for name in &self.core.ctx.settings.wireguard.helper_names {
            killed += self
                .core
                .ctx
                .supervisor
                .kill_by_name(name)
                .await
                .map_err(|e| e.to_string())?;
        }
        if killed == 0 {
            return Err("no WireGuard processes found".into());
        }
        Ok(killed)
    }

    /// Tier 3
    async fn disable_interface(&self, tunnel: &str) -> Result<(), String> {
        let template = &self.core.ctx.settings.wireguard.interface_disable;
        let spec = LaunchSpec::new(
            template.program.clone(),
            template.expand(&[("interface", tunnel)]),
        )
        .elevated(true);
        self.run_checked(&spec).await
    }

    async fn run_checked(&self, spec: &LaunchSpec) -> Result<(), String> {
        let timeout = self.core.ctx.settings.timing.command_timeout();
        match self.core.ctx.supervisor.run(spec, timeout, &self.core.log).await {
            Ok(RunStatus::Success) => Ok(()),
            Ok(RunStatus::Failed(code)) => {
                Err(format!("{} exited with code {:?}", spec.program, code))
            }
            Ok(RunStatus::TimedOut) => Err(format!("{} timed out", spec.program)),
            Err(LaunchError::NotFound(program)) => Err(format!("{} not found", program)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn teardown(&mut self, tunnel: &str) {
        let path = self.config_path.clone().unwrap_or_default();
        let log = self.core.log.clone();

        log.info(format!("Removing tunnel service {}", tunnel));
        let uninstall_error = match self.uninstall(&path, tunnel).await {
            Ok(()) => {
                log.info("Tunnel service removed");
                return;
            }
            Err(e) => e,
        };

        log.warn(format!(
            "Service uninstall failed ({}); killing WireGuard processes",
            uninstall_error
        ));
        let kill_error = match self.kill_helpers().await {
            Ok(count) => {
                log.info(format!("Killed {} WireGuard process(es)", count));
                return;
            }
            Err(e) => e,
        };

        log.warn(format!(
            "Process kill failed ({}); disabling interface {}",
            kill_error, tunnel
        ));
        match self.disable_interface(tunnel).await {
            Ok(()) => log.info(format!("Interface {} disabled", tunnel)),
            Err(e) => log.error(format!(
                "Interface disable failed ({}); the tunnel may still be up",
                e
            )),
        }
    }
}

fn vars<'a>(config: &'a str, tunnel: &'a str) -> [(&'static str, &'a str); 3] {
    [("config", config), ("tunnel", tunnel), ("interface", tunnel)]
}

#[async_trait]
impl BackendSession for WireGuardSession {
    fn protocol(&self) -> Protocol {
        Protocol::WireGuard
    }

    fn apply_config(&mut self, config: &ProtocolConfig) {
        self.config_path = config.wire_guard_config_path.clone();
    }

    fn export_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            wire_guard_config_path: self.config_path.clone(),
            ..ProtocolConfig::new(Protocol::WireGuard)
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
            self.clean_leftovers().await;
            return;
        }
        self.core.monitor.shutdown().await;

        if let Some(tunnel) = self.tunnel.take() {
            self.teardown(&tunnel).await;
        }
        self.core.finish_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Supervisor;
    use crate::testing::Harness;
    use std::time::Duration;

    fn config_file(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("office.conf");
        std::fs::write(&path, "[Interface]\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn connected_session(harness: &Harness, path: &str) -> WireGuardSession {
        let mut session = WireGuardSession::new(harness.context());
        let mut config = ProtocolConfig::new(Protocol::WireGuard);
        config.wire_guard_config_path = Some(path.to_string());
        session.apply_config(&config);

        harness.supervisor.spawn_named("wireguard");
        session.connect().await.unwrap();
        session
    }

    #[test]
    fn test_tunnel_name() {
        assert_eq!(tunnel_name("/etc/wireguard/office.conf"), "office");
        assert_eq!(tunnel_name("wg0.conf"), "wg0");
    }

    #[tokio::test]
    async fn test_connect_installs_service() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = connected_session(&harness, &path).await;

        assert_eq!(session.state(), SessionState::Connected);
        let ran = harness.supervisor.ran();
        assert_eq!(ran.len(), 1);
        assert!(ran[0].elevated);
        assert_eq!(ran[0].args, ["up", path.as_str()]);

        session.disconnect().await;
        let ran = harness.supervisor.ran();
        assert_eq!(ran.len(), 2);
        assert_eq!(ran[1].args, ["down", path.as_str()]);
        assert!(harness.supervisor.killed().is_empty());
        assert!(harness.log_text().contains("Tunnel service removed"));
    }

    #[tokio::test]
    async fn test_tunnel_never_came_up() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = WireGuardSession::new(harness.context());
        let mut config = ProtocolConfig::new(Protocol::WireGuard);
        config.wire_guard_config_path = Some(path);
        session.apply_config(&config);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::StartupFailed(_))
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(harness.supervisor.ran().len(), 2);
    }

    #[tokio::test]
    async fn test_install_refused() {
        let harness = Harness::new();
        harness.supervisor.run_result("up", RunStatus::Failed(Some(126)));
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = WireGuardSession::new(harness.context());
        let mut config = ProtocolConfig::new(Protocol::WireGuard);
        config.wire_guard_config_path = Some(path);
        session.apply_config(&config);

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::ElevationDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_tier_two_after_uninstall_failure() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = connected_session(&harness, &path).await;
        harness.supervisor.run_result("down", RunStatus::Failed(Some(1)));
        harness.log_text();

        session.disconnect().await;

        assert_eq!(harness.supervisor.killed(), ["wireguard", "wg"]);
        let log = harness.log_text();
        assert!(log.contains("Service uninstall failed"));
        assert!(log.contains("Killed 1 WireGuard process(es)"));
        assert!(!log.contains("disabling interface"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tier_three_after_kill_failure() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = connected_session(&harness, &path).await;
        harness.supervisor.run_result("down", RunStatus::TimedOut);
        harness
            .supervisor
            .fail_kill(LaunchError::Other("process table unavailable".into()));
        harness.log_text();

        session.disconnect().await;

        let ran = harness.supervisor.ran();
        assert_eq!(ran.last().unwrap().program, "ip");
        assert_eq!(ran.last().unwrap().args, ["link", "set", "office", "down"]);
        let log = harness.log_text();
        assert!(log.contains("Service uninstall failed"));
        assert!(log.contains("Process kill failed"));
        assert!(log.contains("Interface office disabled"));
    }

    #[tokio::test]
    async fn test_all_tiers_fail() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = connected_session(&harness, &path).await;
        harness.supervisor.run_result("down", RunStatus::Failed(Some(1)));
        harness.supervisor.run_result("link", RunStatus::Failed(Some(2)));
        harness
            .supervisor
            .fail_kill(LaunchError::Other("process table unavailable".into()));
        harness.log_text();

        session.disconnect().await;

        assert!(harness.log_text().contains("the tunnel may still be up"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_skips_tiers() {
        let harness = Harness::new();
        let mut session = WireGuardSession::new(harness.context());

        session.disconnect().await;

        assert!(harness.supervisor.ran().is_empty());
        assert!(harness.supervisor.killed().is_empty());
        assert!(harness.log_text().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_disconnect_removes_leftover_tunnel() {
        let harness = Harness::new();
        harness.supervisor.spawn_named("wireguard");
        let mut session = WireGuardSession::new(harness.context());
        let mut config = ProtocolConfig::new(Protocol::WireGuard);
        config.wire_guard_config_path = Some("/etc/wireguard/office.conf".into());
        session.apply_config(&config);

        session.disconnect().await;

        let ran = harness.supervisor.ran();
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].args, ["down", "/etc/wireguard/office.conf"]);
        let log = harness.log_text();
        assert!(log.contains("Not connected"));
        assert!(log.contains("Leftover tunnel office found"));
        assert!(log.contains("Tunnel service removed"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_kills_leftover_helpers_without_config() {
        let harness = Harness::new();
        harness.supervisor.spawn_named("wireguard");
        let mut session = WireGuardSession::new(harness.context());

        session.disconnect().await;

        assert!(harness.supervisor.ran().is_empty());
        assert_eq!(harness.supervisor.killed(), ["wireguard", "wg"]);
        assert!(harness.supervisor.find_by_name("wireguard").unwrap().is_empty());
        assert!(harness.log_text().contains("Killed 1 WireGuard process(es)"));
    }

    #[tokio::test]
    async fn test_helper_loss_reported() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = config_file(&dir);
        let mut session = connected_session(&harness, &path).await;
        let connected = harness.connected.subscribe();

        harness.supervisor.remove_named("wireguard");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!*connected.borrow());
        assert!(harness.log_text().contains("Tunnel office went down"));
        session.disconnect().await;
    }
}
