//! Finds serial device nodes that may carry the modem's AT channel.

use std::{io, path::Path};
use tracing::debug;

/// Nodes conventionally used for AT commands, most likely first. ttyUSB2 is
/// the AT port in QMI/ECM mode, ttyUSB1 in MBIM mode.
pub const PREFERRED_PORTS: [&str; 8] = [
    "/dev/ttyUSB2",
    "/dev/ttyUSB3",
    "/dev/ttyUSB1",
    "/dev/ttyUSB0",
    "/dev/ttyUSB4",
    "/dev/ttyUSB5",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
];

/// Orders `present` so that preferred nodes come first (in preference order),
/// followed by every other present node in discovery order. Duplicates are
/// dropped.
pub fn order_candidates<S: AsRef<str>>(present: &[String], preferred: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(present.len());

    let preferred_present = preferred
        .iter()
        .map(AsRef::<str>::as_ref)
        .filter(|p| present.iter().any(|q| q.as_str() == *p));

    let rest = present
        .iter()
        .map(String::as_str)
        .filter(|p| !preferred.iter().any(|q| q.as_ref() == *p));

    for port in preferred_present.chain(rest) {
        if !out.iter().any(|o| o == port) {
            out.push(port.to_owned());
        }
    }

    out
}

/// Lists `ttyUSB*` nodes under `dev`, or `ttyACM*` nodes when there are no
/// USB serial nodes at all. Names are sorted to keep discovery stable.
pub fn present_ports(dev: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let dev = dev.as_ref();
    let mut usb = Vec::new();
    let mut acm = Vec::new();

    for entry in dev.read_dir()? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let path = dev.join(name).to_string_lossy().into_owned();
        if name.starts_with("ttyUSB") {
            usb.push(path);
        } else if name.starts_with("ttyACM") {
            acm.push(path);
        }
    }

    let mut ports = if usb.is_empty() {
        debug!("no ttyUSB nodes found, falling back to ttyACM");
        acm
    } else {
        usb
    };
    ports.sort();

    debug!(count = ports.len(), "found serial ports: {}", ports.join(", "));

    Ok(ports)
}

/// Present nodes under `dev`, ordered by [`PREFERRED_PORTS`].
pub fn candidates(dev: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let present = present_ports(dev)?;
    Ok(order_candidates(&present, &PREFERRED_PORTS))
}
