use crate::Result;
use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use serde::Serialize;
use std::{
    fmt,
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

/// State of one network interface at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub interface: String,
    pub connected: bool,
    pub ip_address: Option<Ipv4Addr>,
    pub tx_bytes: Option<u64>,
    pub rx_bytes: Option<u64>,
    pub tx_packets: Option<u64>,
    pub rx_packets: Option<u64>,
}

impl ConnectionSnapshot {
    pub fn disconnected(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            connected: false,
            ip_address: None,
            tx_bytes: None,
            rx_bytes: None,
            tx_packets: None,
            rx_packets: None,
        }
    }
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interface: {}", self.interface)?;
        if let Some(ip) = self.ip_address {
            write!(f, ", IP: {ip}")?;
        }

        if !self.connected {
            return write!(f, ", Status: Disconnected");
        }

        write!(f, ", Status: Connected")?;
        if let Some(b) = self.tx_bytes {
            write!(f, ", Sent: {}", format_bytes(b))?;
        }
        if let Some(b) = self.rx_bytes {
            write!(f, ", Received: {}", format_bytes(b))?;
        }

        Ok(())
    }
}

pub fn format_bytes(count: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = count as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }

    format!("{value:.2} PB")
}

/// Reports the state of a network interface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetStatus: Send + Sync {
    async fn connection(&self, iface: &str) -> Result<ConnectionSnapshot>;
}

/// Reads interface state from sysfs and addresses from `getifaddrs`.
#[derive(Debug, Clone)]
pub struct SysfsNetStatus {
    sysfs: PathBuf,
}

impl SysfsNetStatus {
    pub fn new(sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
        }
    }
}

impl Default for SysfsNetStatus {
    fn default() -> Self {
        Self::new("/sys")
    }
}

#[async_trait]
impl NetStatus for SysfsNetStatus {
    async fn connection(&self, iface: &str) -> Result<ConnectionSnapshot> {
        let iface_path = self.sysfs.join("class").join("net").join(iface);
        if fs::metadata(&iface_path).await.is_err() {
            debug!("interface {iface} not found");
            return Ok(ConnectionSnapshot::disconnected(iface));
        }

        let operstate = read_trimmed(iface_path.join("operstate")).await?;
        let ip_address = ipv4_address(iface)?;
        let connected = match operstate.as_str() {
            "up" => true,
            // usbnet drivers that don't track link state report "unknown"
            "unknown" => {
                ip_address.is_some()
                    || read_counter(iface_path.join("carrier")).await == Some(1)
            }
            _ => false,
        };
        let stats = iface_path.join("statistics");

        Ok(ConnectionSnapshot {
            interface: iface.to_string(),
            connected,
            ip_address,
            tx_bytes: read_counter(stats.join("tx_bytes")).await,
            rx_bytes: read_counter(stats.join("rx_bytes")).await,
            tx_packets: read_counter(stats.join("tx_packets")).await,
            rx_packets: read_counter(stats.join("rx_packets")).await,
        })
    }
}

async fn read_trimmed(path: impl AsRef<Path>) -> Result<String> {
    let raw = fs::read(path).await?;
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}

async fn read_counter(path: PathBuf) -> Option<u64> {
    read_trimmed(&path).await.ok()?.parse().ok()
}

/// First non-loopback IPv4 address assigned to `iface`.
pub fn ipv4_address(iface: &str) -> Result<Option<Ipv4Addr>> {
    let addrs = getifaddrs().map_err(std::io::Error::from)?;

    let ip = addrs
        .filter(|a| a.interface_name == iface)
        .filter_map(|a| a.address)
        .filter_map(|a| a.as_sockaddr_in().map(|sin| *SocketAddrV4::from(*sin).ip()))
        .find(|ip| !ip.is_loopback());

    Ok(ip)
}
