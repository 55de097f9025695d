//! Command/response cycle over the modem's AT serial port.
//!
//! One command is in flight at a time. The transport does not interpret the
//! payload of a reply: it only looks for the expected terminator or `ERROR`
//! and hands the accumulated text back.

use super::scanner;
use crate::{Error, Result};
use serialport::{ClearBuffer, SerialPort};
use std::{
    io::{self, Read, Write},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Byte stream to the modem. Implemented for real serial ports and for
/// in-memory links in tests.
pub trait SerialLink: Read + Write + Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_to_read(&self) -> io::Result<u32>;

    /// Drops any input received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> io::Result<u32> {
        (**self).bytes_to_read().map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens serial links and reports which device nodes are present.
pub trait PortOpener: Send + Sync {
    fn open(
        &self,
        path: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>>;

    /// Present device nodes, most likely AT port first.
    fn candidates(&self) -> io::Result<Vec<String>>;
}

/// Opens real device nodes with the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialportOpener {
    dev: PathBuf,
}

impl SerialportOpener {
    pub fn new(dev: impl Into<PathBuf>) -> Self {
        Self { dev: dev.into() }
    }
}

impl Default for SerialportOpener {
    fn default() -> Self {
        Self::new("/dev")
    }
}

impl PortOpener for SerialportOpener {
    fn open(
        &self,
        path: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                Error::SerialCommunication(format!(
                    "failed to open serial port '{path}': {e}"
                ))
            })?;

        Ok(Box::new(port))
    }

    fn candidates(&self) -> io::Result<Vec<String>> {
        scanner::candidates(&self.dev)
    }
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Device node. Discovered when `None`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Per-call timeout handed to the serial port.
    pub io_timeout: Duration,
    /// How long a command may take to produce its terminator.
    pub command_timeout: Duration,
    /// Pause after opening before the liveness probe.
    pub open_settle: Duration,
    /// Pause between writing a command and the first read.
    pub command_settle: Duration,
    /// Pause between writing a query and the first read in
    /// [`AtTransport::get_response`].
    pub response_settle: Duration,
    pub poll_interval: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            io_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
            open_settle: Duration::from_millis(500),
            command_settle: Duration::from_millis(300),
            response_settle: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The expected terminator was seen.
    Terminator,
    /// The modem answered `ERROR`.
    Error,
    /// Neither marker arrived before the timeout.
    TimedOut,
    /// Fire-and-forget: written without waiting for a reply.
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub response: String,
    pub completion: Completion,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.completion, Completion::Terminator | Completion::Sent)
    }
}

/// The two operations higher layers need from an AT port.
#[cfg_attr(test, mockall::automock)]
pub trait AtChannel: Send {
    /// Sends `command` and reports whether `expected` came back without
    /// `ERROR`. An empty `expected` only waits for the write to complete.
    fn send_command(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<bool>;

    /// Sends `command` and returns the raw reply text.
    fn get_response(&mut self, command: &str, timeout: Duration) -> Result<String>;
}

impl<T: AtChannel + ?Sized> AtChannel for &mut T {
    fn send_command(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<bool> {
        (**self).send_command(command, expected, timeout)
    }

    fn get_response(&mut self, command: &str, timeout: Duration) -> Result<String> {
        (**self).get_response(command, timeout)
    }
}

/// An open AT command port. The link is closed on [`AtTransport::disconnect`]
/// or when the transport is dropped.
pub struct AtTransport {
    link: Option<Box<dyn SerialLink>>,
    port: String,
    settings: SerialSettings,
}

impl AtTransport {
    /// Opens `settings.port`, or the first candidate that answers `AT` when no
    /// port is configured, and checks that the modem responds.
    pub fn connect(opener: &dyn PortOpener, settings: SerialSettings) -> Result<Self> {
        let Some(port) = settings.port.clone() else {
            return Self::discover(opener, settings);
        };

        info!("connecting to modem at {port}");
        let link = opener.open(&port, settings.baud_rate, settings.io_timeout)?;

        Self::probe(link, port, settings)
    }

    /// Wraps an already opened link and checks that the modem responds.
    pub fn probe(
        link: Box<dyn SerialLink>,
        port: String,
        settings: SerialSettings,
    ) -> Result<Self> {
        thread::sleep(settings.open_settle);

        let mut transport = Self {
            link: Some(link),
            port,
            settings,
        };

        let timeout = transport.settings.command_timeout;
        if !transport.send_command("AT", "OK", timeout)? {
            return Err(Error::SerialCommunication(format!(
                "no response from modem on {}",
                transport.port
            )));
        }

        Ok(transport)
    }

    fn discover(opener: &dyn PortOpener, settings: SerialSettings) -> Result<Self> {
        let candidates = opener.candidates()?;
        if candidates.is_empty() {
            return Err(Error::ModemNotFound("no serial modem interfaces found".into()));
        }

        for port in candidates {
            debug!("testing {port}");

            let link = match opener.open(&port, settings.baud_rate, settings.io_timeout) {
                Ok(link) => link,
                Err(e) => {
                    debug!("port {port} error: {e}");
                    continue;
                }
            };

            let mut handshake = Self::probe(link, port.clone(), settings.clone());
            if let Ok(transport) = handshake.as_mut() {
                // stale input left on the port by a previous process
                if let Some(link) = transport.link.as_mut()
                    && let Err(e) = link.clear_input()
                {
                    debug!("port {port} could not clear input: {e}");
                }
            }

            match handshake {
                Ok(transport) => {
                    info!("found modem at {port}");
                    return Ok(transport);
                }
                Err(e) => debug!("port {port} did not answer: {e}"),
            }
        }

        warn!("no modem found responding to AT commands");
        Err(Error::ModemNotFound(
            "no serial port responded to AT".into(),
        ))
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Closes the link. Does nothing when already closed.
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("disconnected from modem at {}", self.port);
        }
    }

    /// Sends `command` and waits for `expected` or `ERROR`.
    pub fn exchange(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let settle = self.settings.command_settle;
        self.transact(command, expected, timeout, settle)
    }

    fn transact(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
        settle: Duration,
    ) -> Result<CommandOutcome> {
        let poll_interval = self.settings.poll_interval;
        let link = self.link_mut()?;

        link.write_all(format!("{command}\r\n").as_bytes())
            .and_then(|()| link.flush())
            .map_err(|e| Error::serial(format!("command {command} failed: {e}")))?;

        if expected.is_empty() {
            debug!(command, "AT command sent without waiting for a reply");
            return Ok(CommandOutcome {
                response: String::new(),
                completion: Completion::Sent,
            });
        }

        thread::sleep(settle);

        let deadline = Instant::now() + timeout;
        let mut raw = Vec::new();

        let completion = loop {
            let pending = link
                .bytes_to_read()
                .map_err(|e| Error::serial(format!("command {command} failed: {e}")))?;

            if pending > 0 {
                let mut buf = vec![0u8; pending as usize];
                let n = link
                    .read(&mut buf)
                    .map_err(|e| Error::serial(format!("command {command} failed: {e}")))?;
                raw.extend_from_slice(&buf[..n]);
            }

            let text = decode(&raw);
            if text.contains("ERROR") {
                break Completion::Error;
            }
            if text.contains(expected) {
                break Completion::Terminator;
            }
            if Instant::now() >= deadline {
                break Completion::TimedOut;
            }

            thread::sleep(poll_interval);
        };

        let response = decode(&raw);
        match completion {
            Completion::Error => warn!(command, "modem returned ERROR"),
            Completion::TimedOut => {
                debug!(command, ?timeout, "no terminator before timeout")
            }
            _ => {}
        }
        debug!("AT command: {command} -> response: {}", response.trim());

        Ok(CommandOutcome {
            response,
            completion,
        })
    }

    fn link_mut(&mut self) -> Result<&mut Box<dyn SerialLink>> {
        self.link
            .as_mut()
            .ok_or_else(|| Error::SerialCommunication("modem not connected".into()))
    }
}

impl AtChannel for AtTransport {
    fn send_command(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<bool> {
        Ok(self.exchange(command, expected, timeout)?.is_success())
    }

    fn get_response(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let settle = self.settings.response_settle;
        let link = self.link_mut()?;

        let stale = link.bytes_to_read().map_err(Error::serial)?;
        if stale > 0 {
            link.clear_input().map_err(Error::serial)?;
        }

        Ok(self.transact(command, "OK", timeout, settle)?.response)
    }
}

impl Drop for AtTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Decodes modem output, dropping bytes that are not valid UTF-8.
fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace(char::REPLACEMENT_CHARACTER, "")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
    };

    #[derive(Default)]
    struct Script {
        replies: HashMap<String, Vec<u8>>,
        pending: VecDeque<u8>,
        line: Vec<u8>,
        written: Vec<String>,
    }

    /// In-memory modem that answers each complete command line from a script.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedLink(Arc<Mutex<Script>>);

    impl ScriptedLink {
        pub(crate) fn reply(self, command: &str, reply: &[u8]) -> Self {
            self.0
                .lock()
                .unwrap()
                .replies
                .insert(command.to_string(), reply.to_vec());
            self
        }

        pub(crate) fn inject(&self, bytes: &[u8]) {
            self.0.lock().unwrap().pending.extend(bytes);
        }

        pub(crate) fn written(&self) -> Vec<String> {
            self.0.lock().unwrap().written.clone()
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut s = self.0.lock().unwrap();
            let n = buf.len().min(s.pending.len());
            for (slot, byte) in buf.iter_mut().zip(s.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut s = self.0.lock().unwrap();
            s.line.extend_from_slice(buf);

            while let Some(pos) = s.line.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = s.line.drain(..pos + 2).collect();
                let cmd = String::from_utf8_lossy(&line[..pos]).into_owned();
                if let Some(reply) = s.replies.get(&cmd).cloned() {
                    s.pending.extend(reply);
                }
                s.written.push(cmd);
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for ScriptedLink {
        fn bytes_to_read(&self) -> io::Result<u32> {
            Ok(self.0.lock().unwrap().pending.len() as u32)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.0.lock().unwrap().pending.clear();
            Ok(())
        }
    }

    struct BrokenLink;

    impl Read for BrokenLink {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }
    }

    impl Write for BrokenLink {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for BrokenLink {
        fn bytes_to_read(&self) -> io::Result<u32> {
            Ok(0)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn fast_settings() -> SerialSettings {
        SerialSettings {
            port: Some("/dev/ttyUSB2".into()),
            command_timeout: Duration::from_millis(50),
            open_settle: Duration::ZERO,
            command_settle: Duration::ZERO,
            response_settle: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    const SHORT: Duration = Duration::from_millis(30);

    fn connected(link: ScriptedLink) -> AtTransport {
        AtTransport::probe(
            Box::new(link.reply("AT", b"OK\r\n")),
            "/dev/ttyUSB2".into(),
            fast_settings(),
        )
        .unwrap()
    }

    struct FakeOpener {
        links: HashMap<String, ScriptedLink>,
        present: Vec<String>,
    }

    impl PortOpener for FakeOpener {
        fn open(&self, path: &str, _: u32, _: Duration) -> Result<Box<dyn SerialLink>> {
            self.links
                .get(path)
                .cloned()
                .map(|l| Box::new(l) as Box<dyn SerialLink>)
                .ok_or_else(|| Error::SerialCommunication(format!("cannot open {path}")))
        }

        fn candidates(&self) -> io::Result<Vec<String>> {
            Ok(scanner::order_candidates(&self.present, &scanner::PREFERRED_PORTS))
        }
    }

    #[test]
    fn ok_reply_is_success() {
        let mut t = connected(ScriptedLink::default());

        assert!(t.send_command("AT", "OK", SHORT).unwrap());
    }

    #[test]
    fn error_reply_is_failure() {
        let link = ScriptedLink::default();
        let mut t = connected(link.clone());
        let link = link.reply("AT+FOO", b"ERROR\r\n");

        assert!(!t.send_command("AT+FOO", "OK", SHORT).unwrap());
        assert_eq!(link.written().last().unwrap(), "AT+FOO");
    }

    #[test]
    fn silence_times_out_as_failure() {
        let mut t = connected(ScriptedLink::default());

        let outcome = t.exchange("AT+SILENT", "OK", SHORT).unwrap();

        assert_eq!(outcome.completion, Completion::TimedOut);
        assert!(!outcome.is_success());
    }

    #[test]
    fn error_wins_over_terminator() {
        let link = ScriptedLink::default();
        let mut t = connected(link.clone());
        link.reply("AT+BOTH", b"OK\r\n+CME ERROR: 3\r\n");

        assert!(!t.send_command("AT+BOTH", "OK", SHORT).unwrap());
    }

    #[test]
    fn custom_terminator_is_matched() {
        let link = ScriptedLink::default();
        let mut t = connected(link.clone());
        link.reply("AT+QPOWD", b"POWERED DOWN\r\n");

        assert!(t.send_command("AT+QPOWD", "POWERED DOWN", SHORT).unwrap());
    }

    #[test]
    fn empty_terminator_is_fire_and_forget() {
        let link = ScriptedLink::default();
        let mut t = connected(link.clone());

        let start = Instant::now();
        let outcome = t.exchange("AT+CFUN=1,1", "", Duration::from_secs(10)).unwrap();

        assert_eq!(outcome.completion, Completion::Sent);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(link.written().last().unwrap(), "AT+CFUN=1,1");
    }

    #[test]
    fn get_response_clears_stale_input_and_returns_raw_text() {
        let link = ScriptedLink::default();
        let mut t = connected(link.clone());
        link.inject(b"RDY\r\n+CPIN: READY\r\n");
        link.reply(
            "AT+QCFG=\"usbnet\"",
            b"\r\n+QCFG: \"usbnet\",1\r\n\r\nOK\r\n",
        );

        let response = t.get_response("AT+QCFG=\"usbnet\"", SHORT).unwrap();

        assert!(!response.contains("RDY"));
        assert!(response.contains("+QCFG: \"usbnet\",1"));
    }

    #[test]
    fn invalid_utf8_is_dropped() {
        let link = ScriptedLink::default();
        let mut t = connected(link.clone());
        link.reply("ATI", b"Quec\xfftel\r\nOK\r\n");

        let response = t.get_response("ATI", SHORT).unwrap();

        assert!(response.contains("Quectel"));
    }

    #[test]
    fn commands_after_disconnect_fail() {
        let mut t = connected(ScriptedLink::default());

        t.disconnect();
        t.disconnect();

        assert!(!t.is_connected());
        assert!(matches!(
            t.send_command("AT", "OK", SHORT),
            Err(Error::SerialCommunication(_))
        ));
        assert!(matches!(
            t.get_response("AT", SHORT),
            Err(Error::SerialCommunication(_))
        ));
    }

    #[test]
    fn io_failure_is_a_serial_error() {
        let mut t = AtTransport {
            link: Some(Box::new(BrokenLink)),
            port: "/dev/ttyUSB2".into(),
            settings: fast_settings(),
        };

        assert!(matches!(
            t.send_command("AT", "OK", SHORT),
            Err(Error::SerialCommunication(_))
        ));
    }

    #[test]
    fn silent_modem_fails_liveness_probe() {
        let result = AtTransport::probe(
            Box::new(ScriptedLink::default()),
            "/dev/ttyUSB2".into(),
            fast_settings(),
        );

        assert!(matches!(result, Err(Error::SerialCommunication(_))));
    }

    #[test]
    fn discovery_picks_first_responding_candidate() {
        let silent = ScriptedLink::default();
        let modem = ScriptedLink::default().reply("AT", b"OK\r\n");
        let opener = FakeOpener {
            links: HashMap::from([
                ("/dev/ttyUSB2".to_string(), silent.clone()),
                ("/dev/ttyUSB3".to_string(), modem.clone()),
            ]),
            present: vec![
                "/dev/ttyUSB0".into(),
                "/dev/ttyUSB2".into(),
                "/dev/ttyUSB3".into(),
            ],
        };
        let settings = SerialSettings {
            port: None,
            ..fast_settings()
        };

        let t = AtTransport::connect(&opener, settings).unwrap();

        assert_eq!(t.port(), "/dev/ttyUSB3");
        assert_eq!(silent.written(), vec!["AT"]);
    }

    #[test]
    fn discovery_without_answer_is_modem_not_found() {
        let opener = FakeOpener {
            links: HashMap::from([("/dev/ttyUSB0".to_string(), ScriptedLink::default())]),
            present: vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into()],
        };
        let settings = SerialSettings {
            port: None,
            ..fast_settings()
        };

        assert!(matches!(
            AtTransport::connect(&opener, settings),
            Err(Error::ModemNotFound(_))
        ));
    }

    #[test]
    fn discovery_with_no_ports_is_modem_not_found() {
        let opener = FakeOpener {
            links: HashMap::new(),
            present: vec![],
        };
        let settings = SerialSettings {
            port: None,
            ..fast_settings()
        };

        assert!(matches!(
            AtTransport::connect(&opener, settings),
            Err(Error::ModemNotFound(_))
        ));
    }

    #[test]
    fn explicit_port_open_failure_is_serial_error() {
        let opener = FakeOpener {
            links: HashMap::new(),
            present: vec![],
        };

        assert!(matches!(
            AtTransport::connect(&opener, fast_settings()),
            Err(Error::SerialCommunication(_))
        ));
    }
}
