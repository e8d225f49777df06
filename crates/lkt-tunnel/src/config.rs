//! Protocol Configuration
//!
//! Provides the protocol discriminator and the protocol-agnostic
//! configuration record exchanged through import/export.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Tunnel backend discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// OpenVPN client process
    OpenVpn,
    /// WireGuard tunnel service
    WireGuard,
    /// Shadowsocks local SOCKS client
    Shadowsocks,
    /// V2Ray local SOCKS client
    V2Ray,
    /// SSH dynamic port forward
    Ssh,
}

impl Protocol {
    /// Get all supported protocols
    pub fn all() -> &'static [Protocol] {
        &[
            Protocol::OpenVpn,
            Protocol::WireGuard,
            Protocol::Shadowsocks,
            Protocol::V2Ray,
            Protocol::Ssh,
        ]
    }

    /// Discriminator string used in profiles
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::OpenVpn => "OpenVPN",
            Protocol::WireGuard => "WireGuard",
            Protocol::Shadowsocks => "Shadowsocks",
            Protocol::V2Ray => "V2Ray",
            Protocol::Ssh => "SSH",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openvpn" => Ok(Protocol::OpenVpn),
            "wireguard" => Ok(Protocol::WireGuard),
            "shadowsocks" => Ok(Protocol::Shadowsocks),
            "v2ray" => Ok(Protocol::V2Ray),
            "ssh" => Ok(Protocol::Ssh),
            _ => Err(ConfigError::UnknownProtocol(s.to_string())),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Protocol-agnostic configuration record
///
/// Field presence depends on `protocol`; fields that do not belong to the
/// selected backend are carried along untouched and ignored on apply.
/// PascalCase aliases accept profiles written by earlier releases.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Backend discriminator
    #[serde(default, alias = "Protocol", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// SSH server host
    #[serde(default, alias = "SSHHost", skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    /// SSH server port (kept as text, validated on connect)
    #[serde(default, alias = "SSHPort", skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<String>,
    /// SSH login name
    #[serde(default, alias = "SSHUsername", skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
    /// SSH password
    #[serde(default, alias = "SSHPassword", skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,

    /// WireGuard `.conf` path
    #[serde(default, alias = "WireGuardConfigPath", skip_serializing_if = "Option::is_none")]
    pub wire_guard_config_path: Option<String>,
    /// OpenVPN `.ovpn` path
    #[serde(
        default,
        rename = "openVPNConfigPath",
        alias = "OpenVPNConfigPath",
        skip_serializing_if = "Option::is_none"
    )]
    pub open_vpn_config_path: Option<String>,
    /// V2Ray JSON config path
    #[serde(
        default,
        rename = "v2RayConfigPath",
        alias = "V2RayConfigPath",
        skip_serializing_if = "Option::is_none"
    )]
    pub v2ray_config_path: Option<String>,
    /// Shadowsocks JSON config path
    #[serde(default, alias = "ShadowSocksConfigPath", skip_serializing_if = "Option::is_none")]
    pub shadow_socks_config_path: Option<String>,

    /// Whether the serialized form was written locked
    #[serde(default, alias = "IsLocked", skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
}

impl ProtocolConfig {
    /// Create an empty record for a protocol
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol: Some(protocol),
            ..Self::default()
        }
    }

    /// Get the discriminator, failing if absent
    pub fn require_protocol(&self) -> Result<Protocol, ConfigError> {
        self.protocol.ok_or(ConfigError::MissingProtocol)
    }
}

impl fmt::Debug for ProtocolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConfig")
            .field("protocol", &self.protocol)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_password", &self.ssh_password.as_ref().map(|_| "[redacted]"))
            .field("wire_guard_config_path", &self.wire_guard_config_path)
            .field("open_vpn_config_path", &self.open_vpn_config_path)
            .field("v2ray_config_path", &self.v2ray_config_path)
            .field("shadow_socks_config_path", &self.shadow_socks_config_path)
            .field("is_locked", &self.is_locked)
            .finish()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Configuration does not name a protocol")]
    MissingProtocol,
}
