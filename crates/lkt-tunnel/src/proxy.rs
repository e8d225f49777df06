//! System Proxy Controller
//!
//! Points the host's system-wide proxy at a local SOCKS endpoint while a
//! SOCKS backend is connected, and clears it again afterwards.
//!
//! # Stores
//!
//! ```text
//! Linux (GNOME)   gsettings org.gnome.system.proxy[.socks]
//! Windows         reg HKCU\...\Internet Settings  ProxyServer / ProxyEnable
//! other           NoopProxyStore (every write reports Unsupported)
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const GNOME_PROXY: &str = "org.gnome.system.proxy";
const GNOME_SOCKS: &str = "org.gnome.system.proxy.socks";
const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Address the system proxy points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub address: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks={}:{}", self.address, self.port)
    }
}

/// Desired proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    Enabled(ProxyEndpoint),
    Disabled,
}

/// Proxy errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyConfigError {
    #[error("Proxy store unsupported: {0}")]
    Unsupported(String),

    #[error("Proxy store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Proxy write failed: {0}")]
    WriteFailed(String),
}

/// OS-level proxy configuration store
pub trait ProxyStore: Send + Sync {
    /// Write the whole setting; a failed write leaves the earlier setting in place
    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyConfigError>;

    fn name(&self) -> &'static str;
}

/// One key written by a command-line store
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoreValue {
    /// gsettings schema or registry path
    scope: &'static str,
    key: &'static str,
    /// Registry value type; unused by gsettings
    kind: &'static str,
    data: String,
}

impl StoreValue {
    fn new(scope: &'static str, key: &'static str, kind: &'static str, data: impl Into<String>) -> Self {
        Self {
            scope,
            key,
            kind,
            data: data.into(),
        }
    }
}

/// Runs one store command and returns its stdout
trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, ProxyConfigError>;
}

struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, ProxyConfigError> {
        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ProxyConfigError::StoreUnavailable(format!("{}: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProxyConfigError::WriteFailed(format!(
                "{} {}: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// A store driven by a command-line tool, one command per key
trait CommandStore {
    const PROGRAM: &'static str;

    /// Keys to write, in order
    fn values(setting: &ProxySetting) -> Vec<StoreValue>;

    fn write_args(value: &StoreValue) -> Vec<String>;

    fn read_args(value: &StoreValue) -> Vec<String>;

    /// Current data of `value` from the read command's output
    fn parse_read(value: &StoreValue, output: &str) -> Option<String>;
}

/// Write every key of `setting`, restoring earlier keys if a later one fails
fn apply_values<S: CommandStore>(
    runner: &dyn CommandRunner,
    setting: &ProxySetting,
) -> Result<(), ProxyConfigError> {
    let values = S::values(setting);

    // The last key is never rolled back, so it need not be read.
    let previous: Vec<Option<String>> = values
        .iter()
        .take(values.len().saturating_sub(1))
        .map(|value| {
            runner
                .run(S::PROGRAM, &S::read_args(value))
                .ok()
                .and_then(|output| S::parse_read(value, &output))
        })
        .collect();

    for (written, value) in values.iter().enumerate() {
        if let Err(e) = runner.run(S::PROGRAM, &S::write_args(value)) {
            rollback::<S>(runner, &values[..written], &previous[..written]);
            return Err(e);
        }
    }
    Ok(())
}

fn rollback<S: CommandStore>(runner: &dyn CommandRunner, written: &[StoreValue], previous: &[Option<String>]) {
    for (value, old) in written.iter().zip(previous).rev() {
        let Some(old) = old else {
            warn!("No earlier {} {} to restore", value.scope, value.key);
            continue;
        };
        let restore = StoreValue {
            data: old.clone(),
            ..value.clone()
        };
        match runner.run(S::PROGRAM, &S::write_args(&restore)) {
            Ok(_) => debug!("Restored {} {} to {}", value.scope, value.key, old),
            Err(e) => warn!("Could not restore {} {}: {}", value.scope, value.key, e),
        }
    }
}

/// GNOME desktop proxy through `gsettings`
#[derive(Debug, Default)]
pub struct GsettingsProxyStore;

impl CommandStore for GsettingsProxyStore {
    const PROGRAM: &'static str = "gsettings";

    fn values(setting: &ProxySetting) -> Vec<StoreValue> {
        match setting {
            ProxySetting::Enabled(endpoint) => vec![
                StoreValue::new(GNOME_SOCKS, "host", "", endpoint.address.clone()),
                StoreValue::new(GNOME_SOCKS, "port", "", endpoint.port.to_string()),
                StoreValue::new(GNOME_PROXY, "mode", "", "manual"),
            ],
            ProxySetting::Disabled => vec![StoreValue::new(GNOME_PROXY, "mode", "", "none")],
        }
    }

    fn write_args(value: &StoreValue) -> Vec<String> {
        args(&["set", value.scope, value.key, &value.data])
    }

    fn read_args(value: &StoreValue) -> Vec<String> {
        args(&["get", value.scope, value.key])
    }

    // `get` prints GVariant text ('127.0.0.1', 1080), which `set` accepts back
    fn parse_read(_value: &StoreValue, output: &str) -> Option<String> {
        let data = output.trim();
        (!data.is_empty()).then(|| data.to_string())
    }
}

impl ProxyStore for GsettingsProxyStore {
    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyConfigError> {
        apply_values::<Self>(&SystemRunner, setting)
    }

    fn name(&self) -> &'static str {
        "gsettings"
    }
}

/// WinINet proxy through `reg`
#[derive(Debug, Default)]
pub struct RegistryProxyStore;

impl CommandStore for RegistryProxyStore {
    const PROGRAM: &'static str = "reg";

    fn values(setting: &ProxySetting) -> Vec<StoreValue> {
        match setting {
            ProxySetting::Enabled(endpoint) => vec![
                StoreValue::new(INTERNET_SETTINGS, "ProxyServer", "REG_SZ", endpoint.to_string()),
                StoreValue::new(INTERNET_SETTINGS, "ProxyEnable", "REG_DWORD", "1"),
            ],
            ProxySetting::Disabled => {
                vec![StoreValue::new(INTERNET_SETTINGS, "ProxyEnable", "REG_DWORD", "0")]
            }
        }
    }

    fn write_args(value: &StoreValue) -> Vec<String> {
        args(&[
            "add",
            value.scope,
            "/v",
            value.key,
            "/t",
            value.kind,
            "/d",
            &value.data,
            "/f",
        ])
    }

    fn read_args(value: &StoreValue) -> Vec<String> {
        args(&["query", value.scope, "/v", value.key])
    }

    // `    ProxyServer    REG_SZ    socks=127.0.0.1:1080`
    fn parse_read(value: &StoreValue, output: &str) -> Option<String> {
        output.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next() != Some(value.key) || fields.next() != Some(value.kind) {
                return None;
            }
            let data = fields.collect::<Vec<_>>().join(" ");
            (!data.is_empty()).then_some(data)
        })
    }
}

impl ProxyStore for RegistryProxyStore {
    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyConfigError> {
        apply_values::<Self>(&SystemRunner, setting)
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}

/// Store for platforms without a supported proxy backend
#[derive(Debug, Default)]
pub struct NoopProxyStore;

impl ProxyStore for NoopProxyStore {
    fn apply(&self, _setting: &ProxySetting) -> Result<(), ProxyConfigError> {
        Err(ProxyConfigError::Unsupported(std::env::consts::OS.to_string()))
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Store matching the running platform
pub fn platform_store() -> Arc<dyn ProxyStore> {
    if cfg!(windows) {
        Arc::new(RegistryProxyStore)
    } else if cfg!(target_os = "linux") {
        Arc::new(GsettingsProxyStore)
    } else {
        Arc::new(NoopProxyStore)
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Owner of the global proxy endpoint
///
/// Writes are serialized; `disable` always reaches the store, even when
/// this controller never enabled anything.
pub struct ProxyController {
    store: Arc<dyn ProxyStore>,
    current: Mutex<Option<ProxyEndpoint>>,
}

impl ProxyController {
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    pub fn enable(&self, endpoint: ProxyEndpoint) -> Result<(), ProxyConfigError> {
        let mut current = self.current.lock();
        self.store.apply(&ProxySetting::Enabled(endpoint.clone()))?;
        info!("System proxy set to {} via {}", endpoint, self.store.name());
        *current = Some(endpoint);
        Ok(())
    }

    pub fn disable(&self) -> Result<(), ProxyConfigError> {
        let mut current = self.current.lock();
        self.store.apply(&ProxySetting::Disabled)?;
        info!("System proxy cleared via {}", self.store.name());
        *current = None;
        Ok(())
    }

    /// Endpoint currently written, if any
    pub fn current(&self) -> Option<ProxyEndpoint> {
        self.current.lock().clone()
    }

    /// Guard that clears the proxy when dropped while armed
    pub fn guard(self: &Arc<Self>) -> ProxyGuard {
        ProxyGuard {
            controller: Arc::clone(self),
            armed: true,
        }
    }
}

/// Clears a still-set proxy on drop
///
/// Drop only runs on an orderly exit or an unwinding panic. A process
/// killed outright (SIGKILL, `panic = "abort"` in release builds) leaves
/// the proxy set; `lkt disconnect <protocol>` clears it afterwards.
pub struct ProxyGuard {
    controller: Arc<ProxyController>,
    armed: bool,
}

impl ProxyGuard {
    /// Drop without touching the proxy
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        if !self.armed || self.controller.current().is_none() {
            return;
        }
        if let Err(e) = self.controller.disable() {
            warn!("Proxy left set at shutdown: {}", e);
        }
    }
}
