//! Carrier presets, network defaults and modem/health tunables.
//!
//! Loaded from YAML. Every section is optional, and carriers listed in the
//! file are merged over the built-in presets.

use crate::{Error, Result, modem::SerialSettings};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::LazyLock,
    time::Duration,
};
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/orb-cellmode/config.yaml";
pub const SUPPORTED_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115_200, 230_400];

static APN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());
static IFACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,15}$").unwrap());

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_interface() -> String {
    "usb0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierConfig {
    pub apn: String,
    #[serde(default = "default_interface")]
    pub preferred_interface: String,
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
}

impl CarrierConfig {
    fn preset(apn: &str) -> Self {
        Self {
            apn: apn.to_string(),
            preferred_interface: default_interface(),
            dns: default_dns(),
        }
    }
}

pub fn carrier_presets() -> BTreeMap<String, CarrierConfig> {
    [
        ("airtel", "airtelgprs.com"),
        ("jio", "jionet"),
        ("vodafone", "www"),
        ("idea", "internet"),
    ]
    .into_iter()
    .map(|(name, apn)| (name.to_string(), CarrierConfig::preset(apn)))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDefaults {
    pub connection_name: String,
    pub route_metric: u32,
    pub autoconnect: bool,
    pub ipv4_method: String,
    pub preferred_interface: String,
    pub dns: Vec<String>,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            connection_name: "RM530-5G-ECM".to_string(),
            route_metric: 100,
            autoconnect: true,
            ipv4_method: "auto".to_string(),
            preferred_interface: default_interface(),
            dns: default_dns(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemSettings {
    /// AT port. Discovered when unset.
    pub port: Option<String>,
    pub at_baudrate: u32,
    #[serde(with = "secs")]
    pub timeout: Duration,
    #[serde(with = "secs")]
    pub command_timeout: Duration,
    #[serde(with = "secs")]
    pub reset_timeout: Duration,
    /// How long the modem needs to come back after the ECM reset.
    #[serde(with = "secs")]
    pub restart_wait: Duration,
}

impl Default for ModemSettings {
    fn default() -> Self {
        Self {
            port: None,
            at_baudrate: 115_200,
            timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(10),
            restart_wait: Duration::from_secs(15),
        }
    }
}

impl ModemSettings {
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.at_baudrate,
            io_timeout: self.timeout,
            command_timeout: self.command_timeout,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interface: String,
    #[serde(with = "secs")]
    pub check_interval: Duration,
    pub failure_threshold: u32,
    pub poor_signal_dbm: i32,
    pub connectivity_target: String,
    #[serde(with = "secs")]
    pub connectivity_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            check_interval: Duration::from_secs(60),
            failure_threshold: 3,
            poor_signal_dbm: -110,
            connectivity_target: "8.8.8.8:53".to_string(),
            connectivity_timeout: Duration::from_secs(2),
        }
    }
}

impl HealthSettings {
    pub fn connectivity_addr(&self) -> Result<SocketAddr> {
        self.connectivity_target.parse().map_err(|_| {
            Error::Configuration(format!(
                "connectivity target '{}' is not an ip:port pair",
                self.connectivity_target
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub carriers: BTreeMap<String, CarrierConfig>,
    pub defaults: NetworkDefaults,
    pub modem: ModemSettings,
    pub health: HealthSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            carriers: carrier_presets(),
            defaults: NetworkDefaults::default(),
            modem: ModemSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl Config {
    /// Reads `path`, or returns the defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = Self::from_yaml(&raw).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("{}: {msg}", path.display()))
            }
            e => e,
        })?;
        info!("loaded config from {}", path.display());

        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let parsed: Config = serde_yaml::from_str(raw)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {e}")))?;

        let mut carriers = carrier_presets();
        carriers.extend(
            parsed
                .carriers
                .into_iter()
                .map(|(name, c)| (name.to_lowercase(), c)),
        );

        Ok(Self { carriers, ..parsed })
    }

    /// Preset for `name`, matched case-insensitively.
    pub fn carrier(&self, name: &str) -> Option<&CarrierConfig> {
        self.carriers.get(&name.to_lowercase())
    }

    /// Checks every setting and reports all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut check = |ctx: &str, r: Result<()>| {
            if let Err(Error::Configuration(msg)) = r {
                problems.push(format!("{ctx}: {msg}"));
            }
        };

        for (name, carrier) in &self.carriers {
            check(&format!("carriers.{name}.apn"), validate_apn(&carrier.apn));
            check(
                &format!("carriers.{name}.preferred_interface"),
                validate_interface(&carrier.preferred_interface),
            );
            check(&format!("carriers.{name}.dns"), validate_dns(&carrier.dns));
        }

        check(
            "defaults.preferred_interface",
            validate_interface(&self.defaults.preferred_interface),
        );
        check("defaults.dns", validate_dns(&self.defaults.dns));
        if self.defaults.connection_name.trim().is_empty() {
            check(
                "defaults.connection_name",
                Err(Error::Configuration("must not be empty".into())),
            );
        }
        check("modem.at_baudrate", validate_baud_rate(self.modem.at_baudrate));
        check("health.interface", validate_interface(&self.health.interface));
        check(
            "health.connectivity_target",
            self.health.connectivity_addr().map(|_| ()),
        );
        if self.health.failure_threshold == 0 {
            check(
                "health.failure_threshold",
                Err(Error::Configuration("must be at least 1".into())),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(problems.join("; ")))
        }
    }
}

pub fn validate_apn(apn: &str) -> Result<()> {
    if apn.is_empty() {
        return Err(Error::Configuration("APN must be a non-empty string".into()));
    }
    if apn.len() > 100 {
        return Err(Error::Configuration("APN must be 100 characters or less".into()));
    }
    if !APN_RE.is_match(apn) {
        return Err(Error::Configuration(format!(
            "APN '{apn}' may only contain alphanumerics, dots, dashes and underscores"
        )));
    }

    Ok(())
}

pub fn validate_interface(iface: &str) -> Result<()> {
    if !IFACE_RE.is_match(iface) {
        return Err(Error::Configuration(format!(
            "interface '{iface}' must be 1-15 alphanumerics or underscores"
        )));
    }

    Ok(())
}

/// Only the first three servers are used and checked.
pub fn validate_dns(dns: &[String]) -> Result<()> {
    if dns.is_empty() {
        return Err(Error::Configuration(
            "at least one DNS server must be specified".into(),
        ));
    }
    if dns.len() > 3 {
        warn!("more than 3 DNS servers specified, only the first 3 will be used");
    }

    for (i, server) in dns.iter().take(3).enumerate() {
        if server.parse::<Ipv4Addr>().is_err() {
            return Err(Error::Configuration(format!(
                "DNS server {} '{server}' is not a valid IPv4 address",
                i + 1
            )));
        }
    }

    Ok(())
}

pub fn validate_baud_rate(baud: u32) -> Result<()> {
    if SUPPORTED_BAUD_RATES.contains(&baud) {
        return Ok(());
    }

    let supported: Vec<String> = SUPPORTED_BAUD_RATES.iter().map(u32::to_string).collect();
    Err(Error::Configuration(format!(
        "baud rate {baud} is not one of {}",
        supported.join(", ")
    )))
}

/// Durations written as (possibly fractional) seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
