// Outbound messages
// One send attempt through the conversation's owning instance, followed by an
// optimistic local echo

use log::{info, warn};
use std::sync::Arc;

use super::store::ConversationStore;
use super::InboxError;
use crate::gateway::GatewayApi;
use crate::models::{ContentType, DeliveryStatus, Direction, Message};

pub struct MessageDispatcher {
    api: Arc<dyn GatewayApi>,
    store: Arc<ConversationStore>,
}

impl MessageDispatcher {
    pub fn new(api: Arc<dyn GatewayApi>, store: Arc<ConversationStore>) -> Self {
        Self { api, store }
    }

    /// Send `text` and append it to the conversation's log.
    ///
    /// The appended message is an echo, not a delivery confirmation. It carries
    /// the gateway's message id when one is returned, so a later history load
    /// replaces it with the gateway's own copy instead of duplicating it.
    /// On failure nothing is appended.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<Message, InboxError> {
        if text.trim().is_empty() {
            return Err(InboxError::EmptyMessage);
        }
        let conversation = self
            .store
            .get(conversation_id)
            .await
            .ok_or_else(|| InboxError::UnknownConversation(conversation_id.to_string()))?;
        let instance = conversation.owner_instance;

        let receipt = match self.api.send_text(&instance, &conversation.remote_jid, text).await {
            Ok(receipt) => receipt,
            Err(source) => {
                warn!("Send to {} via {} failed: {}", conversation_id, instance, source);
                return Err(InboxError::SendFailed {
                    conversation_id: conversation_id.to_string(),
                    instance,
                    source,
                });
            }
        };

        let echo = Message {
            id: receipt
                .provider_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            provider_id: receipt.provider_id,
            text: text.to_string(),
            direction: Direction::Outbound,
            sent_at: chrono::Utc::now().timestamp().max(0) as u64,
            delivery_status: DeliveryStatus::Sent,
            content_type: ContentType::Text,
        };
        let stored = self.store.append_outbound(conversation_id, echo).await?;
        info!("Sent message {} to {} via {}", stored.id, conversation_id, instance);
        Ok(stored)
    }
}
