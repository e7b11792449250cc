//! Network-change detection.
//!
//! Some interface transitions (Wi-Fi roam, VPN up/down, sleep/wake) leave a
//! dead socket that takes minutes to surface as a read error. The monitor
//! polls the local address set and, when it changes, probes the connection
//! right away instead of waiting.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::types::{BridgeError, ConnectionState};

/// Default interval between interface polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reason recorded when a change forces a reconnect.
pub const NETWORK_CHANGE_REASON: &str = "network change detected";

/// Enumerates local interface addresses.
pub trait InterfaceSource: Send + Sync + 'static {
    /// Non-loopback addresses as `"<interface>/<ip>"`, in any order.
    fn addresses(&self) -> std::io::Result<Vec<String>>;
}

/// The host's interfaces, via `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

#[cfg(unix)]
impl InterfaceSource for SystemInterfaces {
    fn addresses(&self) -> std::io::Result<Vec<String>> {
        use nix::net::if_::InterfaceFlags;
        use std::net::{SocketAddrV4, SocketAddrV6};

        let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
        let mut out = Vec::new();
        for ifa in addrs {
            if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
                continue;
            }
            let Some(address) = ifa.address else { continue };
            let ip = if let Some(sin) = address.as_sockaddr_in() {
                SocketAddrV4::from(*sin).ip().to_string()
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                SocketAddrV6::from(*sin6).ip().to_string()
            } else {
                continue;
            };
            out.push(format!("{}/{}", ifa.interface_name, ip));
        }
        Ok(out)
    }
}

#[cfg(not(unix))]
impl InterfaceSource for SystemInterfaces {
    fn addresses(&self) -> std::io::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// What the monitor needs from the connection.
#[async_trait::async_trait]
pub trait ConnectionProbe: Send + Sync + 'static {
    fn state(&self) -> ConnectionState;
    async fn ping(&self) -> Result<(), BridgeError>;
    async fn trigger_reconnect(&self, reason: &str);
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// First successful poll; nothing to compare against.
    Baseline,
    Unchanged,
    /// Addresses changed while not connected; recovery is already owned by
    /// the read loop.
    ChangedWhileDisconnected,
    /// Addresses changed and the connection answered a ping.
    ChangedProbeOk,
    /// Addresses changed and the ping failed; a reconnect was triggered.
    ChangedReconnecting,
    /// Interfaces could not be enumerated; the previous set is kept.
    SourceError,
}

/// Polls interfaces and validates the connection on change.
pub struct NetworkMonitor {
    source: Arc<dyn InterfaceSource>,
    probe: Arc<dyn ConnectionProbe>,
    interval: Duration,
    last: Mutex<Option<Vec<String>>>,
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn ConnectionProbe>, interval: Duration) -> Self {
        Self::with_source(Arc::new(SystemInterfaces), probe, interval)
    }

    /// A zero `interval` falls back to [`DEFAULT_POLL_INTERVAL`].
    pub fn with_source(
        source: Arc<dyn InterfaceSource>,
        probe: Arc<dyn ConnectionProbe>,
        interval: Duration,
    ) -> Self {
        let interval = if interval.is_zero() {
            tracing::warn!(
                default_secs = DEFAULT_POLL_INTERVAL.as_secs(),
                "network poll interval is zero, using default"
            );
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        Self {
            source,
            probe,
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll once and act on any change.
    pub async fn check_once(&self) -> CheckOutcome {
        let mut current = match self.source.addresses() {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(error = %e, "failed to enumerate network interfaces");
                return CheckOutcome::SourceError;
            }
        };
        current.sort();
        current.dedup();

        let previous = self.last.lock().replace(current.clone());
        let Some(previous) = previous else {
            tracing::debug!(addresses = ?current, "network baseline recorded");
            return CheckOutcome::Baseline;
        };
        if previous == current {
            return CheckOutcome::Unchanged;
        }

        let state = self.probe.state();
        tracing::info!(
            before = ?previous,
            after = ?current,
            state = %state,
            "network interfaces changed"
        );
        if state != ConnectionState::Connected {
            return CheckOutcome::ChangedWhileDisconnected;
        }

        match self.probe.ping().await {
            Ok(()) => {
                tracing::info!("connection survived network change");
                CheckOutcome::ChangedProbeOk
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection probe failed after network change");
                self.probe.trigger_reconnect(NETWORK_CHANGE_REASON).await;
                CheckOutcome::ChangedReconnecting
            }
        }
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        tracing::debug!("network monitor stopped");
    }

    /// Run on a background task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
