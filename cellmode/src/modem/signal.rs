use super::transport::AtChannel;
use crate::{Error, Result};
use regex::Regex;
use serde::Serialize;
use std::{fmt, sync::LazyLock, time::Duration};
use tracing::{debug, warn};

static CSQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CSQ:\s*(\d+),\s*(\d+)").unwrap());
static QNWINFO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\+QNWINFO:\s*"([^"]+)""#).unwrap());
static RSRP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rsrp[:\s]+(-?\d+)").unwrap());
static RSRQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rsrq[:\s]+(-?\d+(?:\.\d+)?)").unwrap());
static SINR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sinr[:\s]+(-?\d+(?:\.\d+)?)").unwrap());

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Radio metrics from one read. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalSnapshot {
    /// dBm
    pub rssi: Option<i32>,
    /// dBm
    pub rsrp: Option<i32>,
    /// dB
    pub rsrq: Option<f64>,
    /// dB
    pub sinr: Option<f64>,
    pub network_type: Option<String>,
}

impl SignalSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for SignalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = &self.network_type {
            parts.push(format!("Type: {t}"));
        }
        if let Some(v) = self.rssi {
            parts.push(format!("RSSI: {v} dBm"));
        }
        if let Some(v) = self.rsrp {
            parts.push(format!("RSRP: {v} dBm"));
        }
        if let Some(v) = self.rsrq {
            parts.push(format!("RSRQ: {v} dB"));
        }
        if let Some(v) = self.sinr {
            parts.push(format!("SINR: {v} dB"));
        }

        if parts.is_empty() {
            write!(f, "No signal data")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Converts a `+CSQ` RSSI index to dBm. 99 means "not known".
pub fn rssi_dbm(index: u32) -> Option<i32> {
    match index {
        0..=31 => Some(-113 + 2 * index as i32),
        _ => None,
    }
}

/// RSSI in dBm from a `+CSQ: <rssi>,<ber>` reply.
pub fn parse_csq(reply: &str) -> Option<i32> {
    let caps = CSQ_RE.captures(reply)?;
    rssi_dbm(caps[1].parse().ok()?)
}

/// Access technology from a `+QNWINFO: "<act>",...` reply.
pub fn parse_network_type(reply: &str) -> Option<String> {
    QNWINFO_RE.captures(reply).map(|c| c[1].to_string())
}

/// Fills RSRP, RSRQ and SINR from serving cell text that labels them.
pub fn parse_serving_cell(reply: &str, snapshot: &mut SignalSnapshot) {
    let field = |re: &Regex| re.captures(reply).map(|c| c[1].to_string());

    snapshot.rsrp = field(&RSRP_RE).and_then(|v| v.parse().ok());
    snapshot.rsrq = field(&RSRQ_RE).and_then(|v| v.parse().ok());
    snapshot.sinr = field(&SINR_RE).and_then(|v| v.parse().ok());
}

/// Reads signal metrics. A failing query stops the read: the snapshot keeps
/// whatever was read before it, and the fault is handed back so the caller
/// can decide what to do with the link.
pub fn read_signal(channel: &mut impl AtChannel) -> (SignalSnapshot, Option<Error>) {
    let mut snapshot = SignalSnapshot::default();

    let fault = read_into(channel, &mut snapshot).err();
    if let Some(e) = &fault {
        warn!("error reading signal quality: {e}");
    }
    debug!(%snapshot, "signal quality");

    (snapshot, fault)
}

fn read_into(channel: &mut impl AtChannel, snapshot: &mut SignalSnapshot) -> Result<()> {
    let reply = channel.get_response("AT+CSQ", QUERY_TIMEOUT)?;
    snapshot.rssi = parse_csq(&reply);

    let reply = channel.get_response("AT+QNWINFO", QUERY_TIMEOUT)?;
    snapshot.network_type = parse_network_type(&reply);

    let reply = channel.get_response(r#"AT+QENG="servingcell""#, QUERY_TIMEOUT)?;
    parse_serving_cell(&reply, snapshot);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::transport::MockAtChannel;
    use mockall::predicate::*;
    use proptest::prelude::*;

    #[test]
    fn rssi_index_bounds() {
        assert_eq!(rssi_dbm(0), Some(-113));
        assert_eq!(rssi_dbm(31), Some(-51));
        assert_eq!(rssi_dbm(99), None);
        assert_eq!(rssi_dbm(32), None);
    }

    proptest! {
        #[test]
        fn rssi_is_linear_in_range(index in 0u32..=31) {
            let dbm = rssi_dbm(index).unwrap();
            prop_assert_eq!(dbm, -113 + 2 * index as i32);
            prop_assert!((-113..=-51).contains(&dbm));
        }

        #[test]
        fn rssi_out_of_range_is_unknown(index in 32u32..) {
            prop_assert_eq!(rssi_dbm(index), None);
        }
    }

    #[test]
    fn it_parses_csq() {
        assert_eq!(parse_csq("\r\n+CSQ: 20,99\r\n\r\nOK\r\n"), Some(-73));
        assert_eq!(parse_csq("+CSQ: 99,99"), None);
        assert_eq!(parse_csq("ERROR"), None);
    }

    #[test]
    fn it_parses_network_type() {
        let reply = "+QNWINFO: \"FDD LTE\",\"40445\",\"LTE BAND 3\",1650\r\nOK";

        assert_eq!(parse_network_type(reply).as_deref(), Some("FDD LTE"));
        assert_eq!(parse_network_type("+QNWINFO: No Service"), None);
    }

    #[test]
    fn it_parses_labelled_serving_cell_fields() {
        let mut snapshot = SignalSnapshot::default();

        parse_serving_cell("RSRP: -95\nRSRQ: -10.5\nsinr 13", &mut snapshot);

        assert_eq!(snapshot.rsrp, Some(-95));
        assert_eq!(snapshot.rsrq, Some(-10.5));
        assert_eq!(snapshot.sinr, Some(13.0));
    }

    #[test]
    fn unlabelled_serving_cell_leaves_fields_empty() {
        let mut snapshot = SignalSnapshot::default();

        parse_serving_cell(
            "+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\",404,45",
            &mut snapshot,
        );

        assert!(snapshot.is_empty());
    }

    #[test]
    fn display_lists_present_fields() {
        let snapshot = SignalSnapshot {
            rssi: Some(-73),
            rsrq: Some(-10.5),
            network_type: Some("FDD LTE".into()),
            ..Default::default()
        };

        assert_eq!(
            snapshot.to_string(),
            "Type: FDD LTE, RSSI: -73 dBm, RSRQ: -10.5 dB"
        );
        assert_eq!(SignalSnapshot::default().to_string(), "No signal data");
    }

    #[test]
    fn read_signal_queries_all_three() {
        let mut mock = MockAtChannel::new();
        mock.expect_get_response()
            .with(eq("AT+CSQ"), eq(QUERY_TIMEOUT))
            .returning(|_, _| Ok("+CSQ: 31,99\r\nOK\r\n".into()));
        mock.expect_get_response()
            .with(eq("AT+QNWINFO"), always())
            .returning(|_, _| Ok("+QNWINFO: \"NR5G-SA\",\"40445\"\r\nOK\r\n".into()));
        mock.expect_get_response()
            .with(eq(r#"AT+QENG="servingcell""#), always())
            .returning(|_, _| Ok("rsrp:-88 rsrq:-11 sinr:20.5\r\nOK".into()));

        let (snapshot, fault) = read_signal(&mut mock);

        assert!(fault.is_none());
        assert_eq!(
            snapshot,
            SignalSnapshot {
                rssi: Some(-51),
                rsrp: Some(-88),
                rsrq: Some(-11.0),
                sinr: Some(20.5),
                network_type: Some("NR5G-SA".into()),
            }
        );
    }

    #[test]
    fn read_signal_keeps_partial_data_on_fault() {
        let mut mock = MockAtChannel::new();
        mock.expect_get_response()
            .with(eq("AT+CSQ"), always())
            .returning(|_, _| Ok("+CSQ: 10,99\r\nOK\r\n".into()));
        mock.expect_get_response()
            .with(eq("AT+QNWINFO"), always())
            .returning(|_, _| Err(Error::SerialCommunication("unplugged".into())));

        let (snapshot, fault) = read_signal(&mut mock);

        assert!(matches!(fault, Some(Error::SerialCommunication(_))));
        assert_eq!(snapshot.rssi, Some(-93));
        assert_eq!(snapshot.network_type, None);
        assert_eq!(snapshot.rsrp, None);
    }
}
