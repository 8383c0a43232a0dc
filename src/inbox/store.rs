// Conversation store
// The single owned map of conversations. Readers get snapshots; every write
// goes through one of the crate-internal mutation methods below.

use log::debug;
use std::collections::{HashMap, HashSet};
use tokio::sync::{watch, RwLock};

use super::normalize;
use super::InboxError;
use crate::gateway::{ChatEntry, RemoteIdentity};
use crate::models::{Conversation, Message, PipelineStage};

/// Counts from merging one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub created: usize,
    pub refreshed: usize,
    pub duplicates: usize, // Seen again from a later instance in the same pass
    pub dropped: usize,    // No resolvable identity
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, Conversation>,
    next_index: u64,
    message_txs: HashMap<String, watch::Sender<Vec<Message>>>,
    echoes: HashMap<String, HashSet<String>>, // Conversation -> optimistic echo message ids
}

impl StoreInner {
    fn sorted(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.conversations.values().cloned().collect();
        list.sort_by_key(|c| c.discovery_index);
        list
    }

    fn publish_messages(&self, id: &str) {
        if let (Some(tx), Some(conversation)) = (self.message_txs.get(id), self.conversations.get(id)) {
            tx.send_replace(conversation.messages.clone());
        }
    }
}

pub struct ConversationStore {
    inner: RwLock<StoreInner>,
    list_tx: watch::Sender<Vec<Conversation>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (list_tx, _) = watch::channel(Vec::new());
        Self { inner: RwLock::new(StoreInner::default()), list_tx }
    }

    pub async fn get(&self, id: &str) -> Option<Conversation> {
        self.inner.read().await.conversations.get(id).cloned()
    }

    /// All conversations in discovery order.
    pub async fn list(&self) -> Vec<Conversation> {
        self.inner.read().await.sorted()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.conversations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Conversation>> {
        self.list_tx.subscribe()
    }

    /// Message log of one conversation as an observable.
    pub async fn subscribe_messages(&self, id: &str) -> Option<watch::Receiver<Vec<Message>>> {
        let mut inner = self.inner.write().await;
        let messages = inner.conversations.get(id)?.messages.clone();
        let tx = inner
            .message_txs
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(messages).0);
        Some(tx.subscribe())
    }

    fn publish_list(&self, inner: &StoreInner) {
        self.list_tx.send_replace(inner.sorted());
    }

    /// Merge one sync pass, batches in discovery order.
    ///
    /// First write wins: an identity already in the map keeps its owner and
    /// messages, and only its preview and unread count are refreshed. Within a
    /// pass, the first batch to report an identity is the only one applied.
    pub(crate) async fn merge_pass(&self, batches: Vec<(String, Vec<ChatEntry>)>) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut inner = self.inner.write().await;
        let mut seen_this_pass = HashSet::new();

        for (instance, chats) in batches {
            for chat in chats {
                let Some(identity) = chat.remote_jid.as_deref().and_then(RemoteIdentity::resolve) else {
                    stats.dropped += 1;
                    continue;
                };
                if !seen_this_pass.insert(identity.key.clone()) {
                    stats.duplicates += 1;
                    continue;
                }

                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|body| normalize::message_body(body).1);

                if let Some(existing) = inner.conversations.get_mut(&identity.key) {
                    if let Some(preview) = preview {
                        existing.last_message_preview = preview;
                    }
                    existing.unread_count = chat.unread_count;
                    stats.refreshed += 1;
                    continue;
                }

                let index = inner.next_index;
                inner.next_index += 1;
                let phone = identity.phone().unwrap_or_default().to_string();
                let conversation = Conversation {
                    id: identity.key.clone(),
                    remote_jid: chat.remote_jid.clone().unwrap_or_default(),
                    is_group: identity.is_group,
                    contact_name: chat.name.clone().unwrap_or_else(|| identity.key.clone()),
                    contact_phone: phone,
                    last_message_preview: preview.unwrap_or_default(),
                    pipeline_status: PipelineStage::New,
                    unread_count: chat.unread_count,
                    owner_instance: instance.clone(),
                    discovery_index: index,
                    messages: Vec::new(),
                };
                debug!("New conversation {} owned by {}", conversation.id, instance);
                inner.conversations.insert(identity.key, conversation);
                stats.created += 1;
            }
        }

        self.publish_list(&inner);
        stats
    }

    /// Replace a conversation's log with freshly fetched history, if
    /// `still_wanted` holds once the write lock is taken.
    ///
    /// Optimistic echoes whose provider id shows up in the history are
    /// dropped in favor of the gateway's copy; the rest are kept.
    pub(crate) async fn replace_history<F>(
        &self,
        id: &str,
        history: Vec<Message>,
        still_wanted: F,
    ) -> Result<Option<Vec<Message>>, InboxError>
    where
        F: FnOnce() -> bool,
    {
        let mut inner = self.inner.write().await;
        if !still_wanted() {
            return Ok(None);
        }

        let StoreInner { conversations, echoes, .. } = &mut *inner;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| InboxError::UnknownConversation(id.to_string()))?;
        let pending = echoes.entry(id.to_string()).or_default();

        let fetched_ids: HashSet<&str> = history.iter().filter_map(|m| m.provider_id.as_deref()).collect();
        let mut kept_echoes = Vec::new();
        for message in conversation.messages.drain(..) {
            if !pending.contains(&message.id) {
                continue;
            }
            let confirmed = message.provider_id.as_deref().is_some_and(|p| fetched_ids.contains(p));
            if confirmed {
                pending.remove(&message.id);
            } else {
                kept_echoes.push(message);
            }
        }

        let mut merged = history;
        merged.extend(kept_echoes);
        merged.sort_by_key(|m| m.sent_at); // stable: history order wins ties
        if let Some(last) = merged.last() {
            conversation.last_message_preview = last.text.clone();
        }
        conversation.messages = merged.clone();

        inner.publish_messages(id);
        self.publish_list(&inner);
        Ok(Some(merged))
    }

    /// Append a locally synthesized outbound message.
    ///
    /// Returns the message as stored; if a message with the same provider id
    /// is already in the log, that one is returned and nothing is appended.
    pub(crate) async fn append_outbound(&self, id: &str, mut message: Message) -> Result<Message, InboxError> {
        let mut inner = self.inner.write().await;
        let StoreInner { conversations, echoes, .. } = &mut *inner;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| InboxError::UnknownConversation(id.to_string()))?;

        if let Some(provider_id) = message.provider_id.as_deref() {
            if let Some(existing) = conversation
                .messages
                .iter()
                .find(|m| m.provider_id.as_deref() == Some(provider_id))
            {
                debug!("Message {} already in {}, not echoing", provider_id, id);
                return Ok(existing.clone());
            }
        }

        // Keep timestamps non-decreasing even if the gateway clock ran ahead
        if let Some(last) = conversation.messages.last() {
            message.sent_at = message.sent_at.max(last.sent_at);
        }
        conversation.last_message_preview = message.text.clone();
        conversation.messages.push(message.clone());
        echoes.entry(id.to_string()).or_default().insert(message.id.clone());

        inner.publish_messages(id);
        self.publish_list(&inner);
        Ok(message)
    }

    pub(crate) async fn set_stage(&self, id: &str, stage: PipelineStage) -> Result<(), InboxError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| InboxError::UnknownConversation(id.to_string()))?;
        conversation.pipeline_status = stage;
        self.publish_list(&inner);
        Ok(())
    }
}
