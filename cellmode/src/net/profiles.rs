//! Network profile service contract and its NetworkManager (`nmcli`) backend.

use crate::{
    Error, Result,
    utils::{CmdError, run_cmd},
};
use async_trait::async_trait;
use bon::Builder;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Everything a connection profile is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ProfileSpec {
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub interface: String,
    #[builder(into, default = "auto".to_string())]
    pub ipv4_method: String,
    #[builder(default = 100)]
    pub route_metric: u32,
    #[builder(default = vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()])]
    pub dns: Vec<String>,
    #[builder(default = true)]
    pub autoconnect: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkProfiles: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Creates the profile. Does nothing when one with the same name exists.
    async fn create(&self, spec: &ProfileSpec) -> Result<()>;

    async fn activate(&self, name: &str) -> Result<()>;

    async fn deactivate(&self, name: &str) -> Result<()>;

    async fn active_profiles(&self) -> Result<Vec<String>>;

    async fn interface_address(&self, iface: &str) -> Result<Option<Ipv4Addr>>;
}

#[derive(Debug, Clone, Default)]
pub struct Nmcli;

impl Nmcli {
    /// Fails when NetworkManager's CLI is not installed.
    pub async fn check_available(&self) -> Result<()> {
        run_cmd("nmcli", &["--version"])
            .await
            .map(|_| ())
            .map_err(|_| Error::NetworkConfiguration("NetworkManager (nmcli) not found".into()))
    }
}

fn nm_err(action: &str) -> impl FnOnce(CmdError) -> Error + '_ {
    move |e| Error::NetworkConfiguration(format!("failed to {action}: {e}"))
}

pub fn create_args(spec: &ProfileSpec) -> Vec<String> {
    let dns = if spec.dns.is_empty() {
        "8.8.8.8 1.1.1.1".to_string()
    } else {
        spec.dns.join(" ")
    };

    [
        "connection",
        "add",
        "type",
        "ethernet",
        "ifname",
        spec.interface.as_str(),
        "con-name",
        spec.name.as_str(),
        "ipv4.method",
        spec.ipv4_method.as_str(),
        "ipv4.route-metric",
        spec.route_metric.to_string().as_str(),
        "ipv4.dns",
        dns.as_str(),
        "connection.autoconnect",
        if spec.autoconnect { "yes" } else { "no" },
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Names from `nmcli -t -f NAME connection show --active`.
pub fn parse_active_profiles(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.replace("\\:", ":"))
        .collect()
}

/// First non-loopback address from `ip -o -4 addr show dev <iface>`.
pub fn parse_ipv4(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet")?;
            words.next()?.split('/').next()?.parse::<Ipv4Addr>().ok()
        })
        .find(|ip| !ip.is_loopback())
}

#[async_trait]
impl NetworkProfiles for Nmcli {
    async fn exists(&self, name: &str) -> Result<bool> {
        match run_cmd("nmcli", &["connection", "show", name]).await {
            Ok(_) => Ok(true),
            Err(CmdError::Failed { .. }) => Ok(false),
            Err(e) => Err(nm_err("check connection")(e)),
        }
    }

    async fn create(&self, spec: &ProfileSpec) -> Result<()> {
        if self.exists(&spec.name).await? {
            info!("connection '{}' already exists", spec.name);
            return Ok(());
        }

        info!("creating NetworkManager connection: {}", spec.name);
        let args = create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cmd("nmcli", &args)
            .await
            .map_err(nm_err("create connection"))?;
        info!("connection created");

        Ok(())
    }

    async fn activate(&self, name: &str) -> Result<()> {
        info!("activating connection: {name}");
        run_cmd("nmcli", &["connection", "up", name])
            .await
            .map_err(nm_err("activate connection"))?;

        Ok(())
    }

    async fn deactivate(&self, name: &str) -> Result<()> {
        info!("deactivating connection: {name}");
        run_cmd("nmcli", &["connection", "down", name])
            .await
            .map_err(nm_err("deactivate connection"))?;

        Ok(())
    }

    async fn active_profiles(&self) -> Result<Vec<String>> {
        let out = run_cmd("nmcli", &["-t", "-f", "NAME", "connection", "show", "--active"])
            .await
            .map_err(nm_err("list active connections"))?;

        Ok(parse_active_profiles(&out))
    }

    async fn interface_address(&self, iface: &str) -> Result<Option<Ipv4Addr>> {
        let out = run_cmd("ip", &["-o", "-4", "addr", "show", "dev", iface])
            .await
            .map_err(nm_err("read interface address"))?;
        let ip = parse_ipv4(&out);
        debug!(iface, ?ip, "interface address");

        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_builds_add_arguments() {
        let spec = ProfileSpec::builder()
            .name("RM530-5G-ECM")
            .interface("usb0")
            .dns(vec!["9.9.9.9".into()])
            .autoconnect(false)
            .build();

        assert_eq!(
            create_args(&spec).join(" "),
            "connection add type ethernet ifname usb0 con-name RM530-5G-ECM \
             ipv4.method auto ipv4.route-metric 100 ipv4.dns 9.9.9.9 \
             connection.autoconnect no"
        );
    }

    #[test]
    fn empty_dns_falls_back_to_public_resolvers() {
        let spec = ProfileSpec::builder()
            .name("x")
            .interface("usb0")
            .dns(vec![])
            .build();

        let args = create_args(&spec);

        let pos = args.iter().position(|a| a == "ipv4.dns").unwrap();
        assert_eq!(args[pos + 1], "8.8.8.8 1.1.1.1");
    }

    #[test]
    fn it_parses_active_profiles() {
        let out = "RM530-5G-ECM\nWired connection 1\n\nvpn\\:office\n";

        assert_eq!(
            parse_active_profiles(out),
            vec!["RM530-5G-ECM", "Wired connection 1", "vpn:office"]
        );
    }

    #[test]
    fn it_parses_ip_output() {
        let out = "3: usb0    inet 192.168.225.34/24 brd 192.168.225.255 scope global dynamic usb0\\       valid_lft 43190sec preferred_lft 43190sec";

        assert_eq!(parse_ipv4(out), Some(Ipv4Addr::new(192, 168, 225, 34)));
        assert_eq!(parse_ipv4(""), None);
        assert_eq!(parse_ipv4("1: lo    inet 127.0.0.1/8 scope host lo"), None);
    }
}
