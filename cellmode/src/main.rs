use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr as _};
use orb_cellmode::{
    CONFIG_ENV, SYSLOG_IDENTIFIER,
    config::{Config, DEFAULT_CONFIG_PATH},
    health::{HealthMonitor, HealthStatus, MonitorConfig},
    manager::{Manager, SetupRequest},
    net::Nmcli,
    telemetry::TelemetryConfig,
};
use serde::Serialize;
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, level_filters::LevelFilter, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// YAML config file. Missing file means built-in defaults.
    #[arg(long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// AT port of the modem, e.g. /dev/ttyUSB2. Discovered when unset.
    #[arg(long, global = true)]
    port: Option<String>,

    /// Print machine readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Switch the modem to ECM mode and configure NetworkManager.
    Setup {
        #[arg(long)]
        apn: Option<String>,
        /// Carrier preset, e.g. airtel, jio, vodafone, idea.
        #[arg(long)]
        carrier: Option<String>,
        #[arg(short, long)]
        interface: Option<String>,
        /// Create the connection profile without bringing it up.
        #[arg(long)]
        no_activate: bool,
        /// Skip waiting for the modem to come back after the reset.
        #[arg(long)]
        no_wait: bool,
    },
    /// Show the modem's USB networking mode.
    Mode,
    /// Show signal quality.
    Signal,
    /// Show connection status of an interface.
    Status {
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// Check connection health once, or keep watching it.
    Health {
        #[arg(short, long)]
        interface: Option<String>,
        /// Seconds between checks when watching.
        #[arg(long)]
        interval: Option<u64>,
        /// Unhealthy checks in a row before alerting.
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(short, long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let tel_flusher = TelemetryConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .with_default_level(level)
        .try_init()?;

    let result = run(cli).await;
    tel_flusher.flush();

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(report) => {
            let Some(err) = report.downcast_ref::<orb_cellmode::Error>() else {
                return Err(report);
            };

            eprintln!("Error: {report:#}");
            if let Some(hint) = err.hint() {
                eprintln!("Hint: {hint}");
            }

            let code = u8::try_from(err.exit_code()).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(&cli.config)?;
    if cli.port.is_some() {
        config.modem.port = cli.port.clone();
    }
    config.validate()?;

    let manager = Arc::new(Manager::from_config(config)?);

    let result = match cli.command {
        Command::Setup {
            apn,
            carrier,
            interface,
            no_activate,
            no_wait,
        } => {
            Nmcli.check_available().await?;

            let req = SetupRequest::builder()
                .maybe_apn(apn)
                .maybe_carrier(carrier)
                .maybe_interface(interface)
                .activate(!no_activate)
                .wait_restart(!no_wait)
                .build();
            manager.setup(req).await?;
            println!("Setup complete");
            Ok(())
        }

        Command::Mode => {
            let mode = manager.mode().await?;
            if cli.json {
                print_json(&serde_json::json!({ "mode": mode }))
            } else {
                println!("Current mode: {mode}");
                Ok(())
            }
        }

        Command::Signal => {
            let signal = manager.signal().await?;
            if cli.json {
                print_json(&signal)
            } else {
                println!("{signal}");
                Ok(())
            }
        }

        Command::Status { interface } => {
            let iface =
                interface.unwrap_or_else(|| manager.config().health.interface.clone());
            let mut status = manager.status(&iface).await?;
            if status.connected && status.ip_address.is_none() {
                match manager.interface_address(&iface).await {
                    Ok(ip) => status.ip_address = ip,
                    Err(e) => warn!("could not read address of {iface}: {e}"),
                }
            }
            if cli.json {
                print_json(&status)
            } else {
                println!("{status}");
                match manager.is_active().await {
                    Ok(active) => println!(
                        "Profile {}: {}",
                        manager.config().defaults.connection_name,
                        if active { "active" } else { "inactive" }
                    ),
                    Err(e) => warn!("could not list active profiles: {e}"),
                }
                Ok(())
            }
        }

        Command::Health {
            interface,
            interval,
            threshold,
            watch,
        } => {
            let mut monitor_cfg = MonitorConfig::from(&manager.config().health);
            if let Some(iface) = interface {
                monitor_cfg.interface = iface;
            }
            if let Some(secs) = interval {
                monitor_cfg.check_interval = Duration::from_secs(secs);
            }
            if let Some(n) = threshold {
                monitor_cfg.failure_threshold = n;
            }

            let monitor = HealthMonitor::new(manager.clone(), monitor_cfg);
            if watch {
                watch_health(&monitor, cli.json).await
            } else {
                let status = monitor.check_health().await;
                render_health(&status, cli.json)
            }
        }
    };

    manager.release().await;

    result
}

async fn watch_health(monitor: &HealthMonitor, json: bool) -> Result<()> {
    monitor.add_observer(move |status: &HealthStatus| render_health(status, json));
    monitor.start();

    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sigint = unix::signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => warn!("received SIGTERM"),
        _ = sigint.recv() => warn!("received SIGINT"),
    }

    info!("stopping health monitor");
    monitor.stop().await;

    if let Some(last) = monitor.last_status() {
        info!("last status: {last}");
    }

    Ok(())
}

fn render_health(status: &HealthStatus, json: bool) -> Result<()> {
    if json {
        return print_json(status);
    }

    println!("{status}");
    println!("Checked at: {}", status.checked_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(conn) = &status.connection {
        println!("{conn}");
    }
    if let Some(signal) = &status.signal {
        println!("Signal: {signal}");
    }
    for issue in &status.issues {
        println!("  - {issue}");
    }

    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let out = serde_json::to_string_pretty(value).wrap_err("failed to render JSON")?;
    println!("{out}");

    Ok(())
}
