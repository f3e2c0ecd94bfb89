//! Connectivity classification
//!
//! Every component asks the same question ("may we use the network right
//! now?"), so the raw [`NetworkInfo`] reported by the host is reduced to one
//! [`ConnectionClass`] in exactly one place.

use bridge_traits::network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection class used by every policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    Wifi,
    Cellular,
    Unknown,
    Offline,
}

impl ConnectionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClass::Wifi => "wifi",
            ConnectionClass::Cellular => "cellular",
            ConnectionClass::Unknown => "unknown",
            ConnectionClass::Offline => "offline",
        }
    }
}

/// Classify a host network report.
///
/// Ethernet counts as wifi. A metered non-cellular link counts as cellular.
/// Links the host cannot name are `Unknown`.
pub fn classify(info: &NetworkInfo) -> ConnectionClass {
    match info.status {
        NetworkStatus::Disconnected => ConnectionClass::Offline,
        NetworkStatus::Indeterminate => ConnectionClass::Unknown,
        NetworkStatus::Connected => match info.network_type {
            Some(NetworkType::Cellular) => ConnectionClass::Cellular,
            Some(NetworkType::WiFi | NetworkType::Ethernet) if info.is_metered => {
                ConnectionClass::Cellular
            }
            Some(NetworkType::WiFi | NetworkType::Ethernet) => ConnectionClass::Wifi,
            Some(NetworkType::Other) | None => ConnectionClass::Unknown,
        },
    }
}

/// Latest connection class, shared by the resolver, the window cache and
/// the download gate.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<ConnectionClass>>,
}

impl Connectivity {
    pub fn new(initial: ConnectionClass) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ConnectionClass {
        *self.tx.borrow()
    }

    /// Store a new class. Returns `true` when it differs from the previous one.
    pub fn set(&self, class: ConnectionClass) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == class {
                false
            } else {
                *current = class;
                true
            }
        })
    }

    pub fn update(&self, info: &NetworkInfo) -> bool {
        self.set(classify(info))
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionClass> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    /// Starts as `Unknown` until the first host report arrives.
    fn default() -> Self {
        Self::new(ConnectionClass::Unknown)
    }
}

/// Feed host network changes into `connectivity`, calling `on_change` after
/// every class change.
pub fn spawn_watcher<F>(
    monitor: Arc<dyn NetworkMonitor>,
    connectivity: Connectivity,
    on_change: F,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn(ConnectionClass) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        match monitor.get_network_info().await {
            Ok(info) => {
                if connectivity.update(&info) {
                    on_change(connectivity.current());
                }
            }
            Err(e) => warn!(error = %e, "Initial network query failed"),
        }

        let mut changes = match monitor.subscribe_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "Network change stream unavailable");
                return;
            }
        };

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = changes.next() => next,
            };

            let Some(info) = next else {
                debug!("Network change stream ended");
                break;
            };

            if connectivity.update(&info) {
                let class = connectivity.current();
                info!(class = class.as_str(), "Connection class changed");
                on_change(class);
            }
        }
    })
}
