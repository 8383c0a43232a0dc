// Operator inbox
// Unifies conversations from every connected gateway instance and manages the
// instances' pairing lifecycle. The `Inbox` facade is what a shell talks to.

use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::gateway::{GatewayApi, GatewayError};
use crate::models::{Conversation, GatewayInstance, Message, PairingState, PipelineStage};

pub mod aggregator;
pub mod dispatcher;
pub mod history;
pub mod lifecycle;
pub mod normalize;
pub mod registry;
pub mod store;

pub use aggregator::{ConversationAggregator, DiscoveryOrder, SyncReport};
pub use dispatcher::MessageDispatcher;
pub use history::{HistoryLoader, HistoryOutcome};
pub use lifecycle::{ConnectionLifecycleManager, PairingSession};
pub use registry::{InstanceRegistry, RegistryHealth, StatusTable};
pub use store::{ConversationStore, MergeStats};

/// One instance that could not be synced, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFailure {
    pub instance: String,
    pub error: String,
}

impl std::fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.instance, self.error)
    }
}

fn join_failures(failed: &[InstanceFailure]) -> String {
    failed.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("Gateway unreachable: {0}")]
    Transport(#[from] GatewayError),

    #[error("No connected instances")]
    NoConnectedInstances,

    #[error("All {} connected instances failed to sync ({})", .failed.len(), join_failures(.failed))]
    AllInstancesFailed { failed: Vec<InstanceFailure> },

    #[error(
        "{} of {} instances synced; failed: {}",
        .synced.len(),
        .synced.len() + .failed.len(),
        join_failures(.failed)
    )]
    PartialSyncFailure { synced: Vec<String>, failed: Vec<InstanceFailure> },

    #[error("A sync is already in progress")]
    SyncInProgress,

    #[error("Sending to {conversation_id} via {instance} failed: {source}")]
    SendFailed {
        conversation_id: String,
        instance: String,
        #[source]
        source: GatewayError,
    },

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Invalid instance name: {0:?}")]
    InvalidInstanceName(String),

    #[error("Instance {instance} cannot move from {from} to {to}")]
    InvalidTransition { instance: String, from: PairingState, to: PairingState },

    #[error("Pairing of {instance} timed out after {waited:?}")]
    PairingTimeout { instance: String, waited: Duration },

    #[error("Pairing of {0} was terminated")]
    PairingTerminated(String),
}

/// Runtime policy for an inbox session.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxSettings {
    pub poll_interval: Duration,
    pub pairing_timeout: Duration,
    pub history_limit: usize,
    pub status_table: StatusTable,
    pub discovery_order: DiscoveryOrder,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            pairing_timeout: Duration::from_secs(120),
            history_limit: 50,
            status_table: StatusTable::default(),
            discovery_order: DiscoveryOrder::default(),
        }
    }
}

pub struct Inbox {
    registry: Arc<InstanceRegistry>,
    lifecycle: ConnectionLifecycleManager,
    aggregator: ConversationAggregator,
    history: HistoryLoader,
    dispatcher: MessageDispatcher,
    store: Arc<ConversationStore>,
    settings: InboxSettings,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Inbox {
    pub fn new(api: Arc<dyn GatewayApi>, settings: InboxSettings) -> Self {
        let registry = Arc::new(InstanceRegistry::new(api.clone(), settings.status_table.clone()));
        let store = Arc::new(ConversationStore::new());
        let lifecycle = ConnectionLifecycleManager::new(
            api.clone(),
            registry.clone(),
            settings.status_table.clone(),
            settings.pairing_timeout,
        );
        let aggregator = ConversationAggregator::new(
            api.clone(),
            registry.clone(),
            store.clone(),
            settings.discovery_order.clone(),
        );
        let history = HistoryLoader::new(api.clone(), store.clone(), settings.history_limit);
        let dispatcher = MessageDispatcher::new(api, store.clone());

        Self {
            registry,
            lifecycle,
            aggregator,
            history,
            dispatcher,
            store,
            settings,
            poller: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &InboxSettings {
        &self.settings
    }

    /// Start the periodic instance refresh. Calling it again is a no-op.
    pub fn start_polling(&self) {
        let mut poller = match self.poller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if poller.is_none() {
            *poller = Some(self.registry.clone().spawn_poller(self.settings.poll_interval));
        }
    }

    /// Stop polling; the session's in-memory state is kept.
    pub fn shutdown(&self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
                info!("Instance polling stopped");
            }
        }
    }

    // Instances

    pub async fn refresh(&self) -> Vec<GatewayInstance> {
        self.registry.refresh().await
    }

    pub fn instances(&self) -> Vec<GatewayInstance> {
        self.registry.snapshot()
    }

    pub fn subscribe_instances(&self) -> watch::Receiver<Vec<GatewayInstance>> {
        self.registry.subscribe()
    }

    pub fn registry_health(&self) -> RegistryHealth {
        self.registry.health()
    }

    // Conversations

    pub async fn sync(&self) -> Result<SyncReport, InboxError> {
        self.aggregator.sync().await
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.store.list().await
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.store.get(id).await
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.store.subscribe()
    }

    pub async fn subscribe_messages(&self, id: &str) -> Option<watch::Receiver<Vec<Message>>> {
        self.store.subscribe_messages(id).await
    }

    pub async fn set_stage(&self, id: &str, stage: PipelineStage) -> Result<(), InboxError> {
        self.store.set_stage(id, stage).await
    }

    /// Change the active conversation without loading it; any load in flight
    /// for another conversation will be discarded when it returns.
    pub fn select(&self, id: &str) {
        self.history.select(id);
    }

    pub fn selected(&self) -> Option<String> {
        self.history.selected()
    }

    pub async fn load_history(&self, id: &str) -> Result<HistoryOutcome, InboxError> {
        self.history.load(id).await
    }

    pub async fn send(&self, id: &str, text: &str) -> Result<Message, InboxError> {
        self.dispatcher.send(id, text).await
    }

    // Pairing

    pub async fn create_instance(&self, name: &str) -> Result<PairingSession, InboxError> {
        self.lifecycle.create_instance(name).await
    }

    pub async fn request_qr(&self, name: &str) -> Result<PairingSession, InboxError> {
        self.lifecycle.request_qr(name).await
    }

    pub async fn delete_instance(&self, name: &str) -> Result<(), InboxError> {
        self.lifecycle.delete_instance(name).await
    }

    pub fn cancel_pairing(&self, name: &str) -> Result<PairingSession, InboxError> {
        self.lifecycle.cancel(name)
    }

    pub async fn wait_for_pairing(&self, name: &str) -> Result<PairingSession, InboxError> {
        self.lifecycle.wait_for_pairing(name).await
    }

    pub fn pairing(&self, name: &str) -> Option<PairingSession> {
        self.lifecycle.session(name)
    }

    pub fn subscribe_pairing(&self) -> watch::Receiver<HashMap<String, PairingSession>> {
        self.lifecycle.subscribe()
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.shutdown();
    }
}
