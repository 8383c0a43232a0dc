// Instance registry
// Polls the gateway for its instances and keeps the current set, with the
// gateway's free-form status strings folded into InstanceStatus

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::gateway::{GatewayApi, GatewayError, RawInstance};
use crate::models::{GatewayInstance, InstanceStatus};

/// Translation table from gateway status strings to `InstanceStatus`.
///
/// Matching is case-insensitive. Anything not listed is disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTable {
    online: Vec<String>,
    pairing: Vec<String>,
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new(["open", "connected", "online"], ["connecting", "qrcode", "pairing"])
    }
}

impl StatusTable {
    pub fn new<I, J, S>(online: I, pairing: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fold = |s: S| s.as_ref().trim().to_ascii_lowercase();
        Self {
            online: online.into_iter().map(fold).collect(),
            pairing: pairing.into_iter().map(fold).collect(),
        }
    }

    pub fn classify(&self, raw: &str) -> InstanceStatus {
        let raw = raw.trim().to_ascii_lowercase();
        if self.online.iter().any(|token| *token == raw) {
            InstanceStatus::Connected
        } else if self.pairing.iter().any(|token| *token == raw) {
            InstanceStatus::Connecting
        } else {
            InstanceStatus::Disconnected
        }
    }
}

/// Receives every successful refresh result.
pub trait InstanceObserver: Send + Sync {
    fn instances_refreshed(&self, instances: &[GatewayInstance]);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_success: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct InstanceRegistry {
    api: Arc<dyn GatewayApi>,
    table: StatusTable,
    refresh_lock: TokioMutex<()>,
    instances_tx: watch::Sender<Vec<GatewayInstance>>,
    tombstones: Mutex<HashSet<String>>, // Deleted names hidden from results
    health: Mutex<RegistryHealth>,
    observers: Mutex<Vec<Arc<dyn InstanceObserver>>>,
}

impl InstanceRegistry {
    pub fn new(api: Arc<dyn GatewayApi>, table: StatusTable) -> Self {
        let (instances_tx, _) = watch::channel(Vec::new());
        Self {
            api,
            table,
            refresh_lock: TokioMutex::new(()),
            instances_tx,
            tombstones: Mutex::new(HashSet::new()),
            health: Mutex::new(RegistryHealth::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn InstanceObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    /// Fetch the instance set, failing soft: any error yields an empty set.
    ///
    /// Waits for a refresh already in flight instead of overlapping it.
    pub async fn refresh(&self) -> Vec<GatewayInstance> {
        match self.try_refresh().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Instance refresh failed, reporting no instances: {}", e);
                Vec::new()
            }
        }
    }

    /// Like `refresh`, but keeps the transport error for callers that must
    /// tell "no instances" apart from "gateway unreachable".
    pub async fn try_refresh(&self) -> Result<Vec<GatewayInstance>, GatewayError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Timer entry point: skips the tick if a refresh is already running.
    pub async fn refresh_if_idle(&self) -> Option<Vec<GatewayInstance>> {
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Instance refresh already in flight, skipping tick");
                return None;
            }
        };
        match self.refresh_locked().await {
            Ok(instances) => Some(instances),
            Err(e) => {
                warn!("Scheduled instance refresh failed: {}", e);
                Some(Vec::new())
            }
        }
    }

    async fn refresh_locked(&self) -> Result<Vec<GatewayInstance>, GatewayError> {
        let raw = match self.api.fetch_instances().await {
            Ok(raw) => raw,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        let instances = self.normalize(raw);
        self.record_success();
        self.instances_tx.send_replace(instances.clone());

        let observers = self.observers.lock().map(|o| o.clone()).unwrap_or_default();
        for observer in observers {
            observer.instances_refreshed(&instances);
        }

        debug!(
            "Refreshed {} instances ({} connected)",
            instances.len(),
            instances.iter().filter(|i| i.is_connected()).count()
        );
        Ok(instances)
    }

    fn normalize(&self, raw: Vec<RawInstance>) -> Vec<GatewayInstance> {
        let mut tombstones = match self.tombstones.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Tombstones only need to outlive the gateway still reporting the name
        tombstones.retain(|name| raw.iter().any(|r| r.name == *name));

        let mut seen = HashSet::new();
        raw.into_iter()
            .filter(|r| !tombstones.contains(&r.name))
            .filter(|r| seen.insert(r.name.clone()))
            .map(|r| GatewayInstance {
                status: self.table.classify(&r.status),
                id: r.id,
                name: r.name,
                phone_number: r.phone_number,
            })
            .collect()
    }

    fn record_failure(&self, error: &GatewayError) {
        if let Ok(mut health) = self.health.lock() {
            health.consecutive_failures += 1;
            health.total_failures += 1;
            health.last_error = Some(error.to_string());
        }
    }

    fn record_success(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.consecutive_failures = 0;
            health.last_success = Some(chrono::Utc::now());
        }
    }

    pub fn health(&self) -> RegistryHealth {
        self.health.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Last published instance set.
    pub fn snapshot(&self) -> Vec<GatewayInstance> {
        self.instances_tx.borrow().clone()
    }

    pub fn get(&self, name: &str) -> Option<GatewayInstance> {
        self.instances_tx.borrow().iter().find(|i| i.name == name).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<GatewayInstance>> {
        self.instances_tx.subscribe()
    }

    /// Hide a deleted instance from the published set and from later refreshes.
    pub fn forget(&self, name: &str) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.insert(name.to_string());
        }
        self.instances_tx.send_if_modified(|instances| {
            let before = instances.len();
            instances.retain(|i| i.name != name);
            instances.len() != before
        });
        info!("Instance {} removed from registry", name);
    }

    /// Undo `forget` when a name is created again.
    pub fn revive(&self, name: &str) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.remove(name);
        }
    }

    /// Poll on a fixed period until the handle is aborted.
    pub fn spawn_poller(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        info!("Polling gateway instances every {:?}", period);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.refresh_if_idle().await;
            }
        })
    }
}
