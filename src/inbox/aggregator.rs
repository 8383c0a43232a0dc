// Conversation aggregation
// Pulls the chat list of every connected instance and merges them into the
// conversation store

use futures::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use super::registry::InstanceRegistry;
use super::store::{ConversationStore, MergeStats};
use super::{InboxError, InstanceFailure};
use crate::gateway::GatewayApi;
use crate::models::GatewayInstance;

/// Order in which connected instances are merged, which decides who owns a
/// conversation surfaced by more than one of them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DiscoveryOrder {
    /// As listed by the gateway.
    #[default]
    Gateway,
    /// Alphabetical by instance name.
    Name,
    /// Named instances first, in the given order; the rest as listed by the gateway.
    Priority(Vec<String>),
}

impl DiscoveryOrder {
    pub fn arrange(&self, instances: &mut [GatewayInstance]) {
        match self {
            DiscoveryOrder::Gateway => {}
            DiscoveryOrder::Name => instances.sort_by(|a, b| a.name.cmp(&b.name)),
            DiscoveryOrder::Priority(names) => {
                instances.sort_by_key(|i| names.iter().position(|n| *n == i.name).unwrap_or(usize::MAX))
            }
        }
    }
}

/// Result of one successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub failed: Vec<InstanceFailure>,
    pub merge: MergeStats,
    pub total_conversations: usize,
}

impl SyncReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    /// "N of M instances synced"
    pub fn summary(&self) -> String {
        format!(
            "{} of {} instances synced, {} conversations ({} new)",
            self.synced.len(),
            self.synced.len() + self.failed.len(),
            self.total_conversations,
            self.merge.created
        )
    }

    /// Treat a partial sync as an error.
    pub fn ensure_complete(self) -> Result<SyncReport, InboxError> {
        if self.is_partial() {
            Err(InboxError::PartialSyncFailure { synced: self.synced, failed: self.failed })
        } else {
            Ok(self)
        }
    }
}

pub struct ConversationAggregator {
    api: Arc<dyn GatewayApi>,
    registry: Arc<InstanceRegistry>,
    store: Arc<ConversationStore>,
    order: DiscoveryOrder,
    sync_lock: TokioMutex<()>,
}

impl ConversationAggregator {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        registry: Arc<InstanceRegistry>,
        store: Arc<ConversationStore>,
        order: DiscoveryOrder,
    ) -> Self {
        Self { api, registry, store, order, sync_lock: TokioMutex::new(()) }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Refresh instances, fetch every connected instance's chats concurrently
    /// and merge them. Only one sync runs at a time; overlapping calls are
    /// rejected with `SyncInProgress`.
    pub async fn sync(&self) -> Result<SyncReport, InboxError> {
        let _guard = self.sync_lock.try_lock().map_err(|_| InboxError::SyncInProgress)?;

        let instances = self.registry.try_refresh().await?;
        let mut connected: Vec<GatewayInstance> = instances.into_iter().filter(|i| i.is_connected()).collect();
        if connected.is_empty() {
            info!("Sync skipped: no connected instances");
            return Err(InboxError::NoConnectedInstances);
        }
        self.order.arrange(&mut connected);

        // join_all keeps input order, so merging below follows discovery order
        // rather than whichever response lands first
        let fetches = connected.iter().map(|instance| async move {
            let result = self.api.find_chats(&instance.name).await;
            (instance.name.clone(), result)
        });
        let results = join_all(fetches).await;

        let mut batches = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(chats) => batches.push((name, chats)),
                Err(e) => {
                    warn!("Fetching chats from {} failed: {}", name, e);
                    failed.push(InstanceFailure { instance: name, error: e.to_string() });
                }
            }
        }

        if batches.is_empty() {
            return Err(InboxError::AllInstancesFailed { failed });
        }

        let synced: Vec<String> = batches.iter().map(|(name, _)| name.clone()).collect();
        let merge = self.store.merge_pass(batches).await;
        let report = SyncReport {
            synced,
            failed,
            merge,
            total_conversations: self.store.len().await,
        };

        if report.is_partial() {
            warn!("Partial sync: {}", report.summary());
        } else {
            info!("Sync complete: {}", report.summary());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceStatus;

    fn instance(name: &str) -> GatewayInstance {
        GatewayInstance {
            id: name.to_string(),
            name: name.to_string(),
            status: InstanceStatus::Connected,
            phone_number: None,
        }
    }

    fn names(instances: &[GatewayInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn test_discovery_orders() {
        let mut list = vec![instance("c"), instance("a"), instance("b")];
        DiscoveryOrder::Gateway.arrange(&mut list);
        assert_eq!(names(&list), ["c", "a", "b"]);

        DiscoveryOrder::Name.arrange(&mut list);
        assert_eq!(names(&list), ["a", "b", "c"]);

        let mut list = vec![instance("c"), instance("a"), instance("b")];
        DiscoveryOrder::Priority(vec!["b".to_string()]).arrange(&mut list);
        assert_eq!(names(&list), ["b", "c", "a"]);
    }

    #[test]
    fn test_report_summary_and_strictness() {
        let report = SyncReport {
            synced: vec!["a".to_string()],
            failed: vec![InstanceFailure { instance: "b".to_string(), error: "timeout".to_string() }],
            merge: MergeStats { created: 2, ..Default::default() },
            total_conversations: 2,
        };
        assert!(report.is_partial());
        assert_eq!(report.summary(), "1 of 2 instances synced, 2 conversations (2 new)");
        assert!(matches!(
            report.ensure_complete(),
            Err(InboxError::PartialSyncFailure { ref failed, .. }) if failed.len() == 1
        ));
    }
}
