use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// No serial device answered the `AT` handshake during discovery.
    #[error("modem not found: {0}")]
    ModemNotFound(String),

    /// I/O failure on the serial link, or the link is not open.
    #[error("serial communication error: {0}")]
    SerialCommunication(String),

    /// The network profile service failed an operation.
    #[error("network configuration failed: {0}")]
    NetworkConfiguration(String),

    /// Supplied settings failed validation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("could not read signal quality: {0}")]
    SignalQuality(String),

    /// The modem rejected the switch to ECM mode.
    #[error("modem refused to switch to ECM mode")]
    ModeSwitch,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn serial(e: impl std::fmt::Display) -> Self {
        Error::SerialCommunication(e.to_string())
    }

    /// Faults worth another attempt: the modem may still be enumerating or
    /// restarting. Everything else is reported as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ModemNotFound(_) | Error::SerialCommunication(_))
    }

    /// Process exit code used by the CLI for this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) => 1,
            Error::ModemNotFound(_) => 2,
            Error::SerialCommunication(_) => 3,
            Error::NetworkConfiguration(_) => 4,
            Error::Configuration(_) => 5,
            Error::SignalQuality(_) => 6,
            Error::ModeSwitch => 7,
        }
    }

    /// Short remediation hint shown by the CLI next to the error.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::ModemNotFound(_) => Some(
                "check that the modem is plugged in and that /dev/ttyUSB* nodes exist",
            ),
            Error::SerialCommunication(_) => Some(
                "the AT port may be busy or require root; try another --port",
            ),
            Error::NetworkConfiguration(_) => {
                Some("make sure NetworkManager is running and nmcli is installed")
            }
            Error::Configuration(_) => Some("fix the configuration file or arguments"),
            Error::ModeSwitch => Some("power cycle the modem and run setup again"),
            Error::SignalQuality(_) | Error::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_modem_faults_are_retryable() {
        assert!(Error::ModemNotFound("x".into()).is_retryable());
        assert!(Error::SerialCommunication("x".into()).is_retryable());
        assert!(!Error::Configuration("x".into()).is_retryable());
        assert!(!Error::NetworkConfiguration("x".into()).is_retryable());
        assert!(!Error::ModeSwitch.is_retryable());
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            Error::Io(io::Error::other("x")).exit_code(),
            Error::ModemNotFound(String::new()).exit_code(),
            Error::SerialCommunication(String::new()).exit_code(),
            Error::NetworkConfiguration(String::new()).exit_code(),
            Error::Configuration(String::new()).exit_code(),
            Error::SignalQuality(String::new()).exit_code(),
            Error::ModeSwitch.exit_code(),
        ];

        let mut dedup = codes.to_vec();
        dedup.sort_unstable();
        dedup.dedup();

        assert_eq!(dedup.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}
