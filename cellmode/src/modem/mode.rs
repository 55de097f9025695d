use super::transport::AtChannel;
use crate::Result;
use derive_more::Display;
use regex::Regex;
use serde::Serialize;
use std::{sync::LazyLock, time::Duration};
use tracing::{error, info, warn};

static USBNET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\+QCFG:\s*"usbnet",\s*(\d+)"#).unwrap());

pub const QUERY_USBNET: &str = r#"AT+QCFG="usbnet""#;
pub const SET_DATA_INTERFACE: &str = r#"AT+QCFG="data_interface",0,0"#;
pub const RESET: &str = "AT+CFUN=1,1";

/// USB networking personality of the modem.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModemMode {
    #[display("QMI")]
    Qmi,
    #[display("ECM")]
    Ecm,
    #[display("MBIM")]
    Mbim,
    #[display("RNDIS")]
    Rndis,
    #[display("UNKNOWN")]
    Unknown,
}

impl ModemMode {
    /// Value the modem reports for this mode in the `usbnet` setting.
    pub fn wire_value(self) -> i32 {
        match self {
            ModemMode::Qmi => 0,
            ModemMode::Ecm => 1,
            ModemMode::Mbim => 2,
            ModemMode::Rndis => 3,
            ModemMode::Unknown => -1,
        }
    }

    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => ModemMode::Qmi,
            1 => ModemMode::Ecm,
            2 => ModemMode::Mbim,
            3 => ModemMode::Rndis,
            _ => ModemMode::Unknown,
        }
    }

    /// Extracts the mode from a `+QCFG: "usbnet",<n>` reply.
    pub fn parse_reply(reply: &str) -> Self {
        USBNET_RE
            .captures(reply)
            .and_then(|c| c[1].parse::<i64>().ok())
            .map(Self::from_wire)
            .unwrap_or(ModemMode::Unknown)
    }
}

pub fn set_usbnet_command(mode: ModemMode) -> String {
    format!(r#"AT+QCFG="usbnet",{}"#, mode.wire_value())
}

pub fn set_apn_command(apn: &str) -> String {
    format!(r#"AT+CGDCONT=1,"IP","{apn}""#)
}

/// Queries and changes the modem's USB networking mode over an AT channel.
pub struct ModeController<C> {
    channel: C,
    command_timeout: Duration,
    reset_timeout: Duration,
}

impl<C: AtChannel> ModeController<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            command_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(self, command_timeout: Duration, reset_timeout: Duration) -> Self {
        Self {
            command_timeout,
            reset_timeout,
            ..self
        }
    }

    /// Current mode. A reply that cannot be interpreted yields
    /// [`ModemMode::Unknown`]; only transport faults are errors.
    pub fn mode(&mut self) -> Result<ModemMode> {
        let reply = self.channel.get_response(QUERY_USBNET, self.command_timeout)?;
        let mode = ModemMode::parse_reply(&reply);

        if mode == ModemMode::Unknown {
            warn!("could not determine modem mode from reply: {}", reply.trim());
        } else {
            info!("current modem mode: {mode}");
        }

        Ok(mode)
    }

    /// Puts the modem into ECM mode and restarts it.
    ///
    /// Returns `false` when the modem rejected the mode change or the channel
    /// failed. Once the mode change is accepted, the remaining steps are
    /// attempted but cannot fail the operation: the modem drops off the bus
    /// while resetting and never confirms them.
    pub fn switch_to_ecm(&mut self, apn: Option<&str>) -> bool {
        match self.try_switch_to_ecm(apn) {
            Ok(switched) => switched,
            Err(e) => {
                error!("error switching to ECM mode: {e}");
                false
            }
        }
    }

    fn try_switch_to_ecm(&mut self, apn: Option<&str>) -> Result<bool> {
        let timeout = self.command_timeout;

        if self.mode()? == ModemMode::Ecm {
            info!("modem already in ECM mode");
            if let Some(apn) = apn {
                self.configure_apn(apn);
            }
            return Ok(true);
        }

        info!("switching modem to ECM mode");
        if !self
            .channel
            .send_command(&set_usbnet_command(ModemMode::Ecm), "OK", timeout)?
        {
            error!("modem rejected ECM mode");
            return Ok(false);
        }

        self.best_effort(SET_DATA_INTERFACE, "OK", timeout, "configure data interface");

        if let Some(apn) = apn {
            self.configure_apn(apn);
        }

        info!("resetting modem to apply ECM mode");
        self.best_effort(RESET, "", self.reset_timeout, "reset modem");

        info!("ECM mode switch initiated, modem is restarting");
        Ok(true)
    }

    fn configure_apn(&mut self, apn: &str) {
        info!("configuring APN: {apn}");
        self.best_effort(
            &set_apn_command(apn),
            "OK",
            self.command_timeout,
            "set APN",
        );
    }

    /// Sends a command whose failure is logged and otherwise ignored.
    fn best_effort(&mut self, command: &str, expected: &str, timeout: Duration, what: &str) {
        match self.channel.send_command(command, expected, timeout) {
            Ok(true) => {}
            Ok(false) => warn!("failed to {what}, continuing"),
            Err(e) => warn!("failed to {what}: {e}, continuing"),
        }
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}
