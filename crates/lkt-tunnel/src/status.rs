//! Network Status
//!
//! How the machine looks from outside: the public address, the local IPv4
//! address and adapter, and whether traffic appears to leave through a VPN.
//!
//! The public address comes from the first lookup service in
//! `[status] ip_services` that answers with a parsable address. Requests go
//! out directly, ignoring proxy variables, so a SOCKS backend's system
//! proxy does not change the answer; a VPN tunnel that carries the default
//! route does.

use crate::settings::Settings;
use crate::uplink::InterfaceUplinkProbe;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use sysinfo::Networks;
use tracing::debug;

/// Snapshot of the host's network situation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    pub public_ip: Option<IpAddr>,
    pub local_ip: Option<Ipv4Addr>,
    /// Adapter holding `local_ip`
    pub adapter: Option<String>,
    /// First interface that looks like a VPN uplink
    pub vpn_interface: Option<String>,
    pub vpn_active: bool,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unavailable<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "Unavailable".to_string())
        }

        writeln!(f, "Public IP: {}", or_unavailable(&self.public_ip))?;
        writeln!(f, "Local IP:  {}", or_unavailable(&self.local_ip))?;
        writeln!(f, "Adapter:   {}", or_unavailable(&self.adapter))?;
        match (&self.vpn_interface, self.vpn_active) {
            (Some(interface), true) => write!(f, "VPN:       Connected ({})", interface),
            _ => write!(f, "VPN:       Disconnected"),
        }
    }
}

/// Status errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Collects a [`NetworkStatus`]
pub struct StatusProbe {
    client: reqwest::Client,
    services: Vec<String>,
    uplink: InterfaceUplinkProbe,
}

impl StatusProbe {
    pub fn new(settings: &Settings) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .timeout(settings.status.timeout())
            .no_proxy()
            .build()
            .map_err(|e| StatusError::Client(e.to_string()))?;

        Ok(Self {
            client,
            services: settings.status.ip_services.clone(),
            uplink: InterfaceUplinkProbe::new(&settings.ssh.uplink_keywords),
        })
    }

    /// Public address from the first service that answers
    pub async fn public_ip(&self) -> Option<IpAddr> {
        for url in &self.services {
            match self.fetch(url).await {
                Ok(ip) => {
                    debug!("Public IP {} via {}", ip, url);
                    return Some(ip);
                }
                Err(e) => debug!("IP lookup via {} failed: {}", url, e),
            }
        }
        None
    }

    async fn fetch(&self, url: &str) -> Result<IpAddr, String> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| e.to_string())?
            .text()
            .await
            .map_err(|e| e.to_string())?;

        body.trim()
            .parse()
            .map_err(|_| format!("not an address: {:?}", body.trim()))
    }

    pub async fn check(&self) -> NetworkStatus {
        let public_ip = self.public_ip().await;

        let uplink = self.uplink.clone();
        let (local, vpn_interface) = tokio::task::spawn_blocking(move || {
            let interfaces = interface_addresses();
            let local = pick_local(&interfaces, |name| uplink.matches(name));
            let vpn = interfaces
                .iter()
                .map(|(name, _)| name)
                .find(|name| uplink.matches(name))
                .cloned();
            (local, vpn)
        })
        .await
        .unwrap_or_default();

        let (adapter, local_ip) = local.unzip();
        NetworkStatus {
            vpn_active: looks_like_vpn(public_ip, local_ip, vpn_interface.is_some()),
            public_ip,
            local_ip,
            adapter,
            vpn_interface,
        }
    }
}

/// Interfaces with their addresses, sorted by name
fn interface_addresses() -> Vec<(String, Vec<IpAddr>)> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks
        .list()
        .iter()
        .map(|(name, data)| {
            let addrs = data.ip_networks().iter().map(|net| net.addr).collect();
            (name.clone(), addrs)
        })
        .collect();
    interfaces.sort_by(|a, b| a.0.cmp(&b.0));
    interfaces
}

/// First usable IPv4 address, preferring adapters that are not VPN uplinks
fn pick_local<F>(interfaces: &[(String, Vec<IpAddr>)], is_vpn: F) -> Option<(String, Ipv4Addr)>
where
    F: Fn(&str) -> bool,
{
    let usable = |(name, addrs): &(String, Vec<IpAddr>)| {
        addrs.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified() => {
                Some((name.clone(), *v4))
            }
            _ => None,
        })
    };

    interfaces
        .iter()
        .filter(|(name, _)| !is_vpn(name))
        .find_map(usable)
        .or_else(|| interfaces.iter().find_map(usable))
}

/// Public address is routable, differs from the local one, and a VPN
/// interface exists
fn looks_like_vpn(public_ip: Option<IpAddr>, local_ip: Option<Ipv4Addr>, vpn_interface: bool) -> bool {
    let Some(public_ip) = public_ip else {
        return false;
    };
    let private = match public_ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    };
    if private || local_ip.is_some_and(|local| IpAddr::V4(local) == public_ip) {
        return false;
    }
    vpn_interface
}
