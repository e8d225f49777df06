//! Backend Settings
//!
//! Executable locations, argument templates, ports and timing constants
//! for every backend, loaded from `lktunnel.toml`. Each wrapped tool's
//! command-line dialect lives here as data so a new tool version only
//! needs a settings change.
//!
//! # Example
//!
//! ```toml
//! elevation = ["pkexec"]
//!
//! [shadowsocks]
//! executable = "/usr/local/bin/sslocal"
//! args = ["-c", "{config}"]
//! socks_port = 1080
//!
//! [timing]
//! liveness_interval_ms = 5000
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings file name looked up in the config directory
pub const SETTINGS_FILE: &str = "lktunnel.toml";

/// Complete settings tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Wrapper prepended to elevated commands when not already root
    pub elevation: Vec<String>,
    /// Timeouts and polling intervals
    pub timing: TimingSettings,
    /// System proxy address
    pub proxy: ProxySettings,
    pub openvpn: OpenVpnSettings,
    pub wireguard: WireGuardSettings,
    #[serde(deserialize_with = "shadowsocks_section")]
    pub shadowsocks: SocksSettings,
    #[serde(deserialize_with = "v2ray_section")]
    pub v2ray: SocksSettings,
    pub ssh: SshSettings,
    /// Network status lookups
    pub status: StatusSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            elevation: default_elevation(),
            timing: TimingSettings::default(),
            proxy: ProxySettings::default(),
            openvpn: OpenVpnSettings::default(),
            wireguard: WireGuardSettings::default(),
            shadowsocks: SocksSettings::shadowsocks(),
            v2ray: SocksSettings::v2ray(),
            ssh: SshSettings::default(),
            status: StatusSettings::default(),
        }
    }
}

impl Settings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::ParseError(e.to_string()))
    }
}

/// Timeouts and polling intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Wait after spawning before confirming a connect
    pub settle_ms: u64,
    /// Wait for a killed process to exit
    pub terminate_ms: u64,
    /// Bound on one-shot commands (service install, interface disable)
    pub command_timeout_ms: u64,
    /// Liveness polling interval
    pub liveness_interval_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            terminate_ms: 1000,
            command_timeout_ms: 5000,
            liveness_interval_ms: 5000,
        }
    }
}

impl TimingSettings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn terminate(&self) -> Duration {
        Duration::from_millis(self.terminate_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

/// System proxy address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Address the local SOCKS listeners bind to
    pub host: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
        }
    }
}

/// A program plus argument template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Expand placeholders in the argument list
    pub fn expand(&self, vars: &[(&str, &str)]) -> Vec<String> {
        expand_args(&self.args, vars)
    }
}

/// OpenVPN client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVpnSettings {
    pub executable: String,
    /// Arguments; `{config}` is the `.ovpn` path
    pub args: Vec<String>,
    /// Process name the liveness probe looks for
    pub process_name: String,
}

impl Default for OpenVpnSettings {
    fn default() -> Self {
        #[cfg(windows)]
        let executable = r"C:\Program Files\OpenVPN\bin\openvpn.exe";
        #[cfg(not(windows))]
        let executable = "openvpn";

        Self {
            executable: executable.to_string(),
            args: strings(&["--config", "{config}", "--auth-nocache"]),
            process_name: "openvpn".to_string(),
        }
    }
}

/// How WireGuard liveness is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireGuardLiveness {
    /// A helper process from `helper_names` is running
    Process,
    /// An interface named after the tunnel exists
    Interface,
}

/// WireGuard tunnel service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardSettings {
    pub executable: String,
    /// Service install arguments; `{config}` and `{tunnel}` available
    pub install_args: Vec<String>,
    /// Service uninstall arguments
    pub uninstall_args: Vec<String>,
    /// Helper processes killed on fallback and probed for liveness
    pub helper_names: Vec<String>,
    pub liveness: WireGuardLiveness,
    /// Last-resort interface disable; `{interface}` available
    pub interface_disable: CommandTemplate,
}

impl Default for WireGuardSettings {
    fn default() -> Self {
        #[cfg(windows)]
        let settings = Self {
            executable: r"C:\Program Files\WireGuard\wireguard.exe".to_string(),
            install_args: strings(&["/installtunnelservice", "{config}"]),
            uninstall_args: strings(&["/uninstalltunnelservice", "{tunnel}"]),
            helper_names: strings(&["wireguard", "wg"]),
            liveness: WireGuardLiveness::Process,
            interface_disable: CommandTemplate::new(
                "netsh",
                &["interface", "set", "interface", "{interface}", "admin=disable"],
            ),
        };
        #[cfg(not(windows))]
        let settings = Self {
            executable: "wg-quick".to_string(),
            install_args: strings(&["up", "{config}"]),
            uninstall_args: strings(&["down", "{config}"]),
            helper_names: strings(&["wireguard", "wg"]),
            liveness: WireGuardLiveness::Interface,
            interface_disable: CommandTemplate::new("ip", &["link", "set", "{interface}", "down"]),
        };
        settings
    }
}

/// Local SOCKS client settings (Shadowsocks, V2Ray)
///
/// The two sections share this type but not their defaults: keys left out
/// of `[v2ray]` fall back to [`SocksSettings::v2ray`], not to Shadowsocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocksSettings {
    pub executable: String,
    /// Arguments; `{config}` is the JSON config path
    pub args: Vec<String>,
    /// Port the client listens on, as written in its config
    pub socks_port: u16,
}

/// Keys present in a `[shadowsocks]` or `[v2ray]` table
#[derive(Deserialize)]
struct SocksOverrides {
    executable: Option<String>,
    args: Option<Vec<String>>,
    socks_port: Option<u16>,
}

impl SocksOverrides {
    fn over(self, base: SocksSettings) -> SocksSettings {
        SocksSettings {
            executable: self.executable.unwrap_or(base.executable),
            args: self.args.unwrap_or(base.args),
            socks_port: self.socks_port.unwrap_or(base.socks_port),
        }
    }
}

fn shadowsocks_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SocksSettings, D::Error> {
    SocksOverrides::deserialize(deserializer).map(|o| o.over(SocksSettings::shadowsocks()))
}

fn v2ray_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SocksSettings, D::Error> {
    SocksOverrides::deserialize(deserializer).map(|o| o.over(SocksSettings::v2ray()))
}

impl SocksSettings {
    pub fn shadowsocks() -> Self {
        #[cfg(windows)]
        let executable = r"C:\Program Files\Shadowsocks\sslocal.exe";
        #[cfg(not(windows))]
        let executable = "sslocal";

        Self {
            executable: executable.to_string(),
            args: strings(&["-c", "{config}"]),
            socks_port: 1080,
        }
    }

    pub fn v2ray() -> Self {
        #[cfg(windows)]
        let executable = r"C:\Program Files\V2Ray\v2ray.exe";
        #[cfg(not(windows))]
        let executable = "v2ray";

        Self {
            executable: executable.to_string(),
            args: strings(&["run", "-config", "{config}"]),
            socks_port: 10808,
        }
    }
}

/// SSH dynamic forward settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub executable: String,
    /// Arguments; `{host}`, `{port}`, `{user}`, `{local_port}` available
    pub args: Vec<String>,
    /// Local SOCKS port of the dynamic forward
    pub local_port: u16,
    /// Interface-name substrings that identify a VPN uplink
    pub uplink_keywords: Vec<String>,
    /// Wrapper used when a password is configured (reads `SSHPASS`)
    pub password_wrapper: CommandTemplate,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            executable: "ssh".to_string(),
            args: strings(&[
                "-N",
                "-D",
                "127.0.0.1:{local_port}",
                "-p",
                "{port}",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "--",
                "{user}@{host}",
            ]),
            local_port: 1080,
            uplink_keywords: strings(&["tun", "tap", "wg", "ppp", "utun", "vpn"]),
            password_wrapper: CommandTemplate::new("sshpass", &["-e"]),
        }
    }
}

/// Public address lookup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    /// Plain-text "what is my IP" services, tried in order
    pub ip_services: Vec<String>,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            ip_services: strings(&[
                "https://api.ipify.org",
                "https://checkip.amazonaws.com",
                "https://ifconfig.me/ip",
            ]),
            timeout_ms: 5000,
        }
    }
}

impl StatusSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Replace `{name}` placeholders in each argument
///
/// Single pass: substituted values are never scanned again, so a value
/// that itself contains `{host}` stays literal. Unknown placeholders are
/// kept as written.
pub fn expand_args(args: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    args.iter().map(|arg| expand_one(arg, vars)).collect()
}

fn expand_one(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];
        let Some(close) = rest.find('}') else {
            break;
        };
        let name = &rest[1..close];
        match vars.iter().find(|(var, _)| *var == name) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[..=close]),
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_elevation() -> Vec<String> {
    if cfg!(windows) {
        Vec::new()
    } else {
        strings(&["pkexec"])
    }
}

/// Settings errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}
