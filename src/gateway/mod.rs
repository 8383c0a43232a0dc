// Gateway REST surface for switchboard
// Typed requests against the messaging gateway; no inbox logic lives here

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod client;
pub mod identity;
pub mod payloads;

pub use client::{GatewayClient, RetryPolicy};
pub use identity::RemoteIdentity;

// Endpoint paths, relative to the gateway base URL
pub mod paths {
    pub const FETCH_INSTANCES: &str = "/instance/fetchInstances";
    pub const CREATE_INSTANCE: &str = "/instance/create";
    pub const CONNECT_INSTANCE: &str = "/instance/connect";
    pub const DELETE_INSTANCE: &str = "/instance/delete";
    pub const FIND_CHATS: &str = "/chat/findChats";
    pub const FETCH_MESSAGES: &str = "/chat/fetchMessages";
    pub const SEND_TEXT: &str = "/message/sendText";
}

/// Header carrying the static API key.
pub const API_KEY_HEADER: &str = "apikey";

/// Failure of a single gateway call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned {status} for {path}: {body}")]
    Status { status: u16, path: String, body: String },

    #[error("Unexpected payload from {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(String),
}

/// Instance record as reported by the gateway, status still free-form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstance {
    pub id: String,
    pub name: String,
    pub status: String,
    pub phone_number: Option<String>,
}

/// One entry of an instance's chat list.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub remote_jid: Option<String>,
    pub name: Option<String>,
    pub last_message: Option<Value>, // Raw message body, normalized by the inbox
    pub unread_count: u32,
}

/// One history record, still in the gateway's message shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: Option<String>,
    pub from_me: bool,
    pub timestamp: Option<u64>,
    pub status: Option<String>,
    pub message_type: Option<String>,
    pub body: Value,
}

/// Pairing material returned by create/connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingTicket {
    pub qr_code: Option<String>,
    pub qr_image: Option<String>, // base64 data URL
    pub pairing_code: Option<String>,
    pub state: Option<String>, // Connection state, when the gateway reports one instead of a QR
}

impl PairingTicket {
    pub fn has_qr(&self) -> bool {
        self.qr_code.is_some() || self.qr_image.is_some() || self.pairing_code.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_id: Option<String>,
    pub timestamp: Option<u64>,
}

/// The gateway operations the inbox depends on.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn fetch_instances(&self) -> Result<Vec<RawInstance>, GatewayError>;

    async fn create_instance(&self, name: &str) -> Result<PairingTicket, GatewayError>;

    async fn connect_instance(&self, name: &str) -> Result<PairingTicket, GatewayError>;

    async fn delete_instance(&self, name: &str) -> Result<(), GatewayError>;

    async fn find_chats(&self, instance: &str) -> Result<Vec<ChatEntry>, GatewayError>;

    /// Most recent `count` messages of one chat, newest first.
    async fn fetch_messages(
        &self,
        instance: &str,
        remote_jid: &str,
        count: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError>;

    async fn send_text(
        &self,
        instance: &str,
        remote_jid: &str,
        text: &str,
    ) -> Result<SendReceipt, GatewayError>;
}
