use crate::{
    Error, Result,
    config::{self, Config},
    health::HealthProbe,
    modem::{
        AtTransport, ModeController, ModemMode, PortOpener, SerialSettings,
        SerialportOpener, SignalSnapshot, signal,
    },
    net::{
        ConnectionSnapshot, ConnectivityProbe, NetStatus, NetworkProfiles, Nmcli,
        ProfileSpec, SysfsNetStatus, TcpProbe,
    },
    retry::RetryPolicy,
};
use async_trait::async_trait;
use bon::Builder;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{task, time};
use tracing::{info, warn};

/// Parameters of [`Manager::setup`].
#[derive(Debug, Clone, Builder)]
pub struct SetupRequest {
    /// Takes precedence over the carrier's APN.
    #[builder(into)]
    pub apn: Option<String>,
    #[builder(into)]
    pub carrier: Option<String>,
    /// Takes precedence over the carrier's preferred interface.
    #[builder(into)]
    pub interface: Option<String>,
    #[builder(default = true)]
    pub activate: bool,
    #[builder(default = true)]
    pub wait_restart: bool,
}

/// Ties the modem, the network profile service and the host's network state
/// together.
///
/// The AT port is opened on first use and kept open until
/// [`Manager::release`]. Serial work runs on the blocking thread pool, one
/// exchange at a time.
#[derive(Builder)]
pub struct Manager {
    config: Config,
    #[builder(default = Arc::new(SerialportOpener::default()) as Arc<dyn PortOpener>)]
    opener: Arc<dyn PortOpener>,
    #[builder(default = Arc::new(Nmcli) as Arc<dyn NetworkProfiles>)]
    profiles: Arc<dyn NetworkProfiles>,
    #[builder(default = Arc::new(SysfsNetStatus::default()) as Arc<dyn NetStatus>)]
    net: Arc<dyn NetStatus>,
    #[builder(default = Arc::new(TcpProbe::default()) as Arc<dyn ConnectivityProbe>)]
    connectivity: Arc<dyn ConnectivityProbe>,
    /// Serial settings. Derived from the modem section of the config when unset.
    serial: Option<SerialSettings>,
    #[builder(default = RetryPolicy::builder().delay(Duration::from_secs(2)).build())]
    connect_policy: RetryPolicy,
    #[builder(default = RetryPolicy::exponential())]
    activate_policy: RetryPolicy,
    #[builder(skip)]
    transport: Arc<Mutex<Option<AtTransport>>>,
}

impl Manager {
    /// Manager with the real serial, NetworkManager and sysfs backends.
    pub fn from_config(config: Config) -> Result<Self> {
        let connectivity = TcpProbe {
            target: config.health.connectivity_addr()?,
            timeout: config.health.connectivity_timeout,
        };

        Ok(Self::builder()
            .config(config)
            .connectivity(Arc::new(connectivity))
            .build())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn serial_settings(&self) -> SerialSettings {
        self.serial
            .clone()
            .unwrap_or_else(|| self.config.modem.serial_settings())
    }

    /// Runs `f` on the blocking pool with the AT transport, opening it first
    /// when needed. A serial fault closes the link, so the next call reopens
    /// it; the modem may have reset or re-enumerated.
    async fn with_transport<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut AtTransport) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.transport.clone();
        let opener = self.opener.clone();
        let settings = self.serial_settings();
        let policy = self.connect_policy;

        task::spawn_blocking(move || {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

            if !slot.as_ref().is_some_and(AtTransport::is_connected) {
                let transport = policy.retry_retryable(|| {
                    AtTransport::connect(opener.as_ref(), settings.clone())
                })?;
                *slot = Some(transport);
            }

            let Some(transport) = slot.as_mut() else {
                return Err(Error::SerialCommunication("modem not connected".into()));
            };

            let result = f(transport);
            if let Err(Error::SerialCommunication(e)) = &result {
                warn!("dropping AT link to {} after fault: {e}", transport.port());
                transport.disconnect();
            }

            result
        })
        .await
        .map_err(|e| Error::SerialCommunication(format!("serial worker failed: {e}")))?
    }

    /// Closes the AT port if it is open.
    pub async fn release(&self) {
        let slot = self.transport.clone();
        let _ = task::spawn_blocking(move || {
            if let Some(mut transport) =
                slot.lock().unwrap_or_else(PoisonError::into_inner).take()
            {
                transport.disconnect();
            }
        })
        .await;
    }

    fn controller_timeouts(&self) -> (Duration, Duration) {
        (self.config.modem.command_timeout, self.config.modem.reset_timeout)
    }

    pub async fn mode(&self) -> Result<ModemMode> {
        let (command, reset) = self.controller_timeouts();
        self.with_transport(move |t| {
            ModeController::new(t).with_timeouts(command, reset).mode()
        })
        .await
    }

    /// Signal metrics. Queries that fail leave their fields empty; only
    /// failing to reach the modem at all is an error.
    pub async fn signal(&self) -> Result<SignalSnapshot> {
        self.with_transport(|t| {
            let (snapshot, fault) = signal::read_signal(t);
            if let Some(Error::SerialCommunication(_)) = fault {
                t.disconnect();
            }

            Ok(snapshot)
        })
        .await
    }

    pub async fn status(&self, iface: &str) -> Result<ConnectionSnapshot> {
        self.net.connection(iface).await
    }

    /// Address of `iface` as seen by the network profile service.
    pub async fn interface_address(&self, iface: &str) -> Result<Option<Ipv4Addr>> {
        self.profiles.interface_address(iface).await
    }

    /// Whether `iface` is up, has an address and reaches the internet.
    pub async fn verify(&self, iface: &str) -> Result<bool> {
        let conn = self.status(iface).await?;
        if !conn.connected || conn.ip_address.is_none() {
            return Ok(false);
        }

        self.connectivity.check().await
    }

    /// Whether the configured connection profile is currently active.
    pub async fn is_active(&self) -> Result<bool> {
        let name = &self.config.defaults.connection_name;
        Ok(self.profiles.active_profiles().await?.contains(name))
    }

    pub async fn disconnect(&self) -> Result<()> {
        info!("disconnecting: {}", self.config.defaults.connection_name);
        self.profiles
            .deactivate(&self.config.defaults.connection_name)
            .await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.profiles
            .activate(&self.config.defaults.connection_name)
            .await
    }

    /// Switches the modem to ECM mode and sets up the connection profile for
    /// its network interface.
    pub async fn setup(&self, req: SetupRequest) -> Result<()> {
        info!("starting setup");

        let carrier = match req.carrier.as_deref() {
            Some(name) => Some(self.config.carrier(name).ok_or_else(|| {
                Error::Configuration(format!("unknown carrier '{name}'"))
            })?),
            None => None,
        };

        let apn = req
            .apn
            .or_else(|| carrier.map(|c| c.apn.clone()))
            .ok_or_else(|| {
                Error::Configuration(
                    "APN must be specified or a carrier must be provided".into(),
                )
            })?;
        let interface = req
            .interface
            .or_else(|| carrier.map(|c| c.preferred_interface.clone()))
            .unwrap_or_else(|| self.config.defaults.preferred_interface.clone());

        config::validate_apn(&apn)?;
        config::validate_interface(&interface)?;

        info!("switching modem to ECM mode with APN: {apn}");
        let (command, reset) = self.controller_timeouts();
        let switched = self
            .with_transport(move |t| {
                Ok(ModeController::new(t)
                    .with_timeouts(command, reset)
                    .switch_to_ecm(Some(apn.as_str())))
            })
            .await?;
        if !switched {
            return Err(Error::ModeSwitch);
        }

        // the modem re-enumerates, the old port handle is useless
        self.release().await;

        if req.wait_restart {
            info!(
                "waiting {:?} for the modem to restart",
                self.config.modem.restart_wait
            );
            time::sleep(self.config.modem.restart_wait).await;
        }

        let defaults = &self.config.defaults;
        let spec = ProfileSpec::builder()
            .name(defaults.connection_name.clone())
            .interface(interface)
            .ipv4_method(defaults.ipv4_method.clone())
            .route_metric(defaults.route_metric)
            .dns(carrier.map_or_else(|| defaults.dns.clone(), |c| c.dns.clone()))
            .autoconnect(defaults.autoconnect)
            .build();

        info!("configuring NetworkManager for interface: {}", spec.interface);
        self.profiles.create(&spec).await?;

        if req.activate {
            self.activate_policy
                .retry_async(
                    |e: &Error| matches!(e, Error::NetworkConfiguration(_)),
                    async || self.profiles.activate(&spec.name).await,
                )
                .await?;
        }

        info!("setup complete");
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for Manager {
    async fn connection(&self, iface: &str) -> Result<ConnectionSnapshot> {
        self.status(iface).await
    }

    async fn check_connectivity(&self) -> Result<bool> {
        self.connectivity.check().await
    }

    async fn signal(&self) -> Result<SignalSnapshot> {
        Manager::signal(self).await
    }
}
