//! Periodic connection health checks with change notifications.
//!
//! A check looks at the interface, internet reachability and signal strength.
//! The monitor runs checks on a timer in a background task and notifies its
//! observers when the connection turns healthy or unhealthy, and once more
//! when a failure streak reaches the configured threshold.

use crate::{
    Result, config::HealthSettings, modem::SignalSnapshot, net::ConnectionSnapshot,
    utils::State,
};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    /// Unhealthy checks in a row, including this one. Zero when healthy.
    pub consecutive_failures: u32,
    pub issues: Vec<String>,
    pub connection: Option<ConnectionSnapshot>,
    pub signal: Option<SignalSnapshot>,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.healthy { "Healthy" } else { "Unhealthy" };
        write!(
            f,
            "Health Status: {state} (Failures: {})",
            self.consecutive_failures
        )
    }
}

/// What a health check needs to know about the link.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn connection(&self, iface: &str) -> Result<ConnectionSnapshot>;

    /// Whether the internet is reachable.
    async fn check_connectivity(&self) -> Result<bool>;

    async fn signal(&self) -> Result<SignalSnapshot>;
}

/// Receives statuses worth reporting. Errors and panics are logged and do not
/// affect other observers.
pub trait HealthObserver: Send + Sync {
    fn on_status(&self, status: &HealthStatus) -> color_eyre::Result<()>;
}

impl<F> HealthObserver for F
where
    F: Fn(&HealthStatus) -> color_eyre::Result<()> + Send + Sync,
{
    fn on_status(&self, status: &HealthStatus) -> color_eyre::Result<()> {
        self(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, PartialEq, Builder)]
pub struct MonitorConfig {
    #[builder(into, default = "usb0".to_string())]
    pub interface: String,
    #[builder(default = Duration::from_secs(60))]
    pub check_interval: Duration,
    /// Unhealthy checks in a row that trigger an extra notification.
    #[builder(default = 3)]
    pub failure_threshold: u32,
    /// RSSI below this marks the connection unhealthy.
    #[builder(default = -110)]
    pub poor_signal_dbm: i32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&HealthSettings> for MonitorConfig {
    fn from(s: &HealthSettings) -> Self {
        Self {
            interface: s.interface.clone(),
            check_interval: s.check_interval,
            failure_threshold: s.failure_threshold,
            poor_signal_dbm: s.poor_signal_dbm,
        }
    }
}

#[derive(Default)]
struct Shared {
    last: Option<HealthStatus>,
    observers: Vec<(ObserverId, Arc<dyn HealthObserver>)>,
    next_id: u64,
}

struct Inner {
    probe: Arc<dyn HealthProbe>,
    config: MonitorConfig,
    shared: State<Shared>,
    /// Held for a whole check, so checks never overlap.
    checking: tokio::sync::Mutex<()>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    inner: Arc<Inner>,
    task: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                probe,
                config,
                shared: State::new(Shared::default()),
                checking: tokio::sync::Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Starts the background loop. Does nothing when it is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("health monitor is already running");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(self.inner.clone(), token.clone()));
        *task = Some(Running { token, handle });

        info!(
            "health monitor started (check interval: {:?})",
            self.inner.config.check_interval
        );
    }

    /// Asks the loop to exit after the current check and waits for it, for a
    /// bounded time. Does nothing when it is not running.
    pub async fn stop(&self) {
        let running = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { token, mut handle }) = running else {
            return;
        };

        token.cancel();
        if time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!("health monitor did not stop within {STOP_TIMEOUT:?}, aborting");
            handle.abort();
        }

        info!("health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Runs one check now and records it as the latest status. Waits for a
    /// check the loop may be running, and notifies observers under the same
    /// rules as the loop.
    pub async fn check_health(&self) -> HealthStatus {
        self.inner.tick().await
    }

    pub fn add_observer(&self, observer: impl HealthObserver + 'static) -> ObserverId {
        self.inner.shared.write(|s| {
            let id = ObserverId(s.next_id);
            s.next_id += 1;
            s.observers.push((id, Arc::new(observer)));
            id
        })
    }

    /// Returns whether an observer was registered under `id`.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.shared.write(|s| {
            let before = s.observers.len();
            s.observers.retain(|(oid, _)| *oid != id);
            s.observers.len() != before
        })
    }

    pub fn last_status(&self) -> Option<HealthStatus> {
        self.inner.shared.read(|s| s.last.clone())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(running) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.token.cancel();
        }
    }
}

async fn run(inner: Arc<Inner>, token: CancellationToken) {
    debug!("health monitoring loop started");

    loop {
        // a panicking check only loses this iteration
        let iteration = tokio::spawn({
            let inner = inner.clone();
            async move {
                inner.tick().await;
            }
        });
        if let Err(e) = iteration.await {
            error!("error in health monitoring loop: {e}");
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = time::sleep(inner.config.check_interval) => {}
        }
    }

    debug!("health monitoring loop exited");
}

impl Inner {
    async fn tick(&self) -> HealthStatus {
        let _checking = self.checking.lock().await;

        let (previous_healthy, status) = self.check().await;
        debug!("health check: {status}");

        if should_notify(previous_healthy, &status, self.config.failure_threshold) {
            self.notify(&status);
        }

        status
    }

    /// Runs a check and records it. Also returns whether the previous status
    /// was healthy, if there was one.
    async fn check(&self) -> (Option<bool>, HealthStatus) {
        let Observation {
            issues,
            connection,
            signal,
        } = self.observe().await;
        let healthy = issues.is_empty();

        self.shared.write(|s| {
            let previous = s.last.as_ref();
            let consecutive_failures = if healthy {
                0
            } else {
                previous.map_or(0, |p| p.consecutive_failures) + 1
            };

            let status = HealthStatus {
                healthy,
                checked_at: Utc::now(),
                consecutive_failures,
                issues,
                connection,
                signal,
            };
            let previous_healthy = previous.map(|p| p.healthy);
            s.last = Some(status.clone());

            (previous_healthy, status)
        })
    }

    async fn observe(&self) -> Observation {
        let mut obs = Observation::default();
        let iface = &self.config.interface;

        let conn = match self.probe.connection(iface).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("health check failed: {e}");
                obs.issues.push(format!("health check error: {e}"));
                return obs;
            }
        };

        if !conn.connected {
            obs.issues.push("connection not active".into());
        } else if conn.ip_address.is_none() {
            obs.issues.push("no IP address assigned".into());
        }

        if conn.connected {
            match self.probe.check_connectivity().await {
                Ok(true) => {}
                Ok(false) => obs.issues.push("internet connectivity failed".into()),
                Err(e) => {
                    warn!("failed to verify internet connectivity: {e}");
                    obs.issues.push(format!("connectivity check failed: {e}"));
                }
            }
        }
        obs.connection = Some(conn);

        match self.probe.signal().await {
            Ok(signal) => {
                if let Some(rssi) = signal.rssi
                    && rssi < self.config.poor_signal_dbm
                {
                    obs.issues.push(format!("poor signal strength: {rssi} dBm"));
                }
                obs.signal = Some(signal);
            }
            Err(e) => debug!("could not check signal quality: {e}"),
        }

        obs
    }

    fn notify(&self, status: &HealthStatus) {
        let observers: Vec<_> = self.shared.read(|s| {
            s.observers.iter().map(|(_, o)| o.clone()).collect()
        });

        for observer in observers {
            match panic::catch_unwind(AssertUnwindSafe(|| observer.on_status(status))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("health observer error: {e}"),
                Err(_) => error!("health observer panicked"),
            }
        }
    }
}

#[derive(Default)]
struct Observation {
    issues: Vec<String>,
    connection: Option<ConnectionSnapshot>,
    signal: Option<SignalSnapshot>,
}

/// A flip between healthy and unhealthy is always reported, no previous
/// status counting as healthy. A failure streak is reported once more when
/// it reaches `threshold`.
pub fn should_notify(previous_healthy: Option<bool>, status: &HealthStatus, threshold: u32) -> bool {
    let flipped = status.healthy != previous_healthy.unwrap_or(true);
    let threshold_reached = !status.healthy && status.consecutive_failures == threshold;

    flipped || threshold_reached
}
