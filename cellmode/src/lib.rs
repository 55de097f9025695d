//! Switches a Quectel style cellular modem into ECM mode over its AT port and
//! keeps an eye on the resulting connection.

pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod modem;
pub mod net;
pub mod retry;
pub mod telemetry;
pub mod utils;

pub use error::{Error, Result};

pub const SYSLOG_IDENTIFIER: &str = "worldcoin-cellmode";
pub const CONFIG_ENV: &str = "ORB_CELLMODE_CONFIG";
