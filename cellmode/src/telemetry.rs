//! Process wide log output. Install once, from the binary.
//!
//! Under systemd there is no terminal and records go to journald with the
//! binary's syslog identifier. Interactive runs get compact lines on stderr.
//! `RUST_LOG` overrides the default level either way.

use std::io::{self, IsTerminal as _, Write as _};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Where log records end up.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sink {
    Journald(String),
    Stderr,
}

impl Sink {
    fn select(syslog_identifier: Option<&str>, interactive: bool) -> Self {
        match syslog_identifier {
            Some(id) if !interactive => Sink::Journald(id.to_owned()),
            _ => Sink::Stderr,
        }
    }

    /// Falls back to stderr when the journald socket is unreachable.
    fn into_layer(self) -> BoxedLayer {
        let Sink::Journald(id) = self else {
            return stderr_layer();
        };

        match tracing_journald::layer() {
            Ok(layer) => layer.with_syslog_identifier(id).boxed(),
            Err(e) => {
                eprintln!("journald unavailable, logging to stderr: {e}");
                stderr_layer()
            }
        }
    }
}

fn stderr_layer() -> BoxedLayer {
    tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(io::stderr)
        .boxed()
}

#[derive(Debug)]
pub struct TelemetryConfig {
    syslog_identifier: Option<String>,
    default_level: LevelFilter,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            syslog_identifier: None,
            default_level: LevelFilter::INFO,
        }
    }

    /// Logs to journald under `syslog_identifier` unless stderr is a terminal.
    #[must_use]
    pub fn with_journald(self, syslog_identifier: &str) -> Self {
        Self {
            syslog_identifier: Some(syslog_identifier.to_owned()),
            ..self
        }
    }

    /// Level used when `RUST_LOG` is not set.
    #[must_use]
    pub fn with_default_level(self, default_level: LevelFilter) -> Self {
        Self {
            default_level,
            ..self
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.default_level.into())
            .from_env_lossy()
    }

    pub fn try_init(self) -> Result<TelemetryFlusher, tracing_subscriber::util::TryInitError> {
        let filter = self.filter();
        let sink = Sink::select(
            self.syslog_identifier.as_deref(),
            io::stderr().is_terminal(),
        );

        tracing_subscriber::registry()
            .with(sink.into_layer())
            .with(filter)
            .try_init()?;

        Ok(TelemetryFlusher)
    }
}

#[must_use = "call .flush at the end of the program, otherwise logs may get lost"]
pub struct TelemetryFlusher;

impl TelemetryFlusher {
    pub fn flush(self) {
        io::stderr().flush().ok();
        io::stdout().flush().ok();
    }
}
