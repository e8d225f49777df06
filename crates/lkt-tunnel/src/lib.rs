//! LKtunnel - Tunnel Session Manager
//!
//! Drives one of several external tunnel clients (OpenVPN, WireGuard,
//! Shadowsocks, V2Ray, SSH dynamic forwarding) through a common session
//! lifecycle, and keeps the host's system proxy in step with whichever
//! tunnel is actually up.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  TunnelSessionManager                     │
//! │   select / connect / disconnect / import / export         │
//! │                                                           │
//! │  ┌─────────┐ ┌──────────┐ ┌─────────────┐ ┌───────────┐  │
//! │  │ OpenVPN │ │WireGuard │ │ SS / V2Ray  │ │    SSH    │  │
//! │  └────┬────┘ └────┬─────┘ └──────┬──────┘ └─────┬─────┘  │
//! │       │           │              │              │        │
//! │  ┌────▼───────────▼──────────────▼──┐  ┌────────▼─────┐  │
//! │  │        ProcessSupervisor         │  │ UplinkProbe  │  │
//! │  └──────────────────────────────────┘  └──────────────┘  │
//! │  ┌──────────────────┐  ┌─────────────────────────────┐   │
//! │  │ LivenessMonitor  │  │ ProxyController → OS store  │   │
//! │  └──────────────────┘  └─────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//!         │ LogStream                 │ connected (watch)
//!         ▼                           ▼
//!                       caller
//! ```
//!
//! # Features
//!
//! - **One active backend**: switching is refused until the active one is down
//! - **Proxy follows the tunnel**: SOCKS backends set and clear the system proxy
//! - **Liveness polling**: unexpected loss is logged and acted on without the caller
//! - **Locked profiles**: ChaCha20-Poly1305 with a BLAKE2s-derived key
//! - **Network status**: public and local address with a VPN heuristic

mod codec;
mod config;
mod liveness;
mod log;
mod manager;
mod process;
mod proxy;
mod session;
mod settings;
mod status;
mod uplink;

#[cfg(test)]
mod testing;

pub use codec::{CodecError, ConfigCodec, DecryptError, LOCKED_PREFIX, PROFILE_EXTENSION, ParseError};
pub use config::{ConfigError, Protocol, ProtocolConfig};
pub use liveness::{LivenessMonitor, Transition};
pub use log::{LOG_CAPACITY, LogEntry, LogLevel, LogSink, LogStream, channel as log_channel};
pub use manager::{ManagerError, TunnelSessionManager};
pub use process::{
    LaunchError, LaunchSpec, ProcessHandle, ProcessStatus, ProcessSupervisor, RunStatus,
    Supervisor, resolve_executable,
};
pub use proxy::{
    GsettingsProxyStore, NoopProxyStore, ProxyConfigError, ProxyController, ProxyEndpoint,
    ProxyGuard, ProxySetting, ProxyStore, RegistryProxyStore, platform_store,
};
pub use session::{
    Backend, BackendSession, ConnectError, LocalSocksSession, OpenSshConnector, OpenVpnSession,
    RemoteTunnel, SessionContext, SessionState, SshConnector, SshSession, SshTarget,
    TunnelCheck, WireGuardSession,
};
pub use settings::{
    CommandTemplate, OpenVpnSettings, ProxySettings, SETTINGS_FILE, Settings, SettingsError,
    SocksSettings, SshSettings, StatusSettings, TimingSettings, WireGuardLiveness, WireGuardSettings,
};
pub use status::{NetworkStatus, StatusError, StatusProbe};
pub use uplink::{InterfaceUplinkProbe, UplinkProbe, interface_exists};
