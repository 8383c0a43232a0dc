// History loading
// Fetches the recent messages of one conversation from its owning instance.
// Responses that arrive after the operator moved to another conversation are
// discarded.

use log::{debug, info};
use std::sync::{Arc, Mutex};

use super::normalize;
use super::store::ConversationStore;
use super::InboxError;
use crate::gateway::{GatewayApi, MessageRecord};
use crate::models::{Direction, Message};

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    Loaded(Vec<Message>),
    /// Another conversation (or a newer load) was selected while this one was in flight.
    Superseded { conversation_id: String },
}

#[derive(Debug, Default)]
struct Selection {
    conversation_id: Option<String>,
    generation: u64,
}

pub struct HistoryLoader {
    api: Arc<dyn GatewayApi>,
    store: Arc<ConversationStore>,
    limit: usize,
    selection: Mutex<Selection>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn GatewayApi>, store: Arc<ConversationStore>, limit: usize) -> Self {
        Self { api, store, limit, selection: Mutex::new(Selection::default()) }
    }

    /// Make `conversation_id` the active selection and return its generation.
    pub fn select(&self, conversation_id: &str) -> u64 {
        let mut selection = match self.selection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        selection.generation += 1;
        selection.conversation_id = Some(conversation_id.to_string());
        selection.generation
    }

    pub fn selected(&self) -> Option<String> {
        self.selection.lock().ok().and_then(|s| s.conversation_id.clone())
    }

    fn is_current(&self, conversation_id: &str, generation: u64) -> bool {
        self.selection
            .lock()
            .map(|s| s.generation == generation && s.conversation_id.as_deref() == Some(conversation_id))
            .unwrap_or(false)
    }

    /// Select the conversation and load its most recent messages, oldest first.
    pub async fn load(&self, conversation_id: &str) -> Result<HistoryOutcome, InboxError> {
        let conversation = self
            .store
            .get(conversation_id)
            .await
            .ok_or_else(|| InboxError::UnknownConversation(conversation_id.to_string()))?;
        let generation = self.select(conversation_id);

        debug!(
            "Loading {} messages of {} via {}",
            self.limit, conversation_id, conversation.owner_instance
        );
        let fetched = self
            .api
            .fetch_messages(&conversation.owner_instance, &conversation.remote_jid, self.limit)
            .await;

        let superseded = || HistoryOutcome::Superseded { conversation_id: conversation_id.to_string() };
        let mut records = match fetched {
            Ok(records) => records,
            Err(_) if !self.is_current(conversation_id, generation) => return Ok(superseded()),
            Err(e) => return Err(e.into()),
        };

        // Newest first, so this keeps the most recent ones
        records.truncate(self.limit);
        let history = ingest(records);
        let applied = self
            .store
            .replace_history(conversation_id, history, || self.is_current(conversation_id, generation))
            .await?;

        match applied {
            Some(messages) => {
                info!("Loaded {} messages for {}", messages.len(), conversation_id);
                Ok(HistoryOutcome::Loaded(messages))
            }
            None => {
                info!("Discarding stale history for {}", conversation_id);
                Ok(superseded())
            }
        }
    }
}

/// Convert gateway records (newest first) into messages ordered by
/// non-decreasing timestamp.
pub fn ingest(records: Vec<MessageRecord>) -> Vec<Message> {
    let mut messages: Vec<Message> = records
        .into_iter()
        .map(|record| {
            let direction = if record.from_me { Direction::Outbound } else { Direction::Inbound };
            let (content_type, text) = normalize::message_body(&record.body);
            Message {
                id: record.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                provider_id: record.id,
                text,
                direction,
                sent_at: record.timestamp.unwrap_or(0),
                delivery_status: normalize::delivery_status(record.status.as_deref(), direction),
                content_type,
            }
        })
        .collect();

    messages.reverse();
    // Reversal alone suffices for well-behaved gateways; the stable sort
    // covers the ones that interleave
    messages.sort_by_key(|m| m.sent_at);
    messages
}
