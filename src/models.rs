use serde::{Deserialize, Serialize};

/// One independently paired connection to the messaging network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInstance {
    pub id: String,
    pub name: String, // Routing key for every per-instance call
    pub status: InstanceStatus,
    pub phone_number: Option<String>,
}

impl GatewayInstance {
    pub fn is_connected(&self) -> bool {
        self.status == InstanceStatus::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InstanceStatus::Disconnected => "disconnected",
            InstanceStatus::Connecting => "connecting",
            InstanceStatus::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Stages a conversation moves through on the operator board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum PipelineStage {
    #[default]
    New,
    InProgress,
    Waiting,
    Done,
}

/// A deduplicated thread with one remote contact, whichever instance surfaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,         // Canonical remote identity
    pub remote_jid: String, // Provider address as first discovered, used for history and send
    pub is_group: bool,
    pub contact_name: String,
    pub contact_phone: String,
    pub last_message_preview: String,
    pub pipeline_status: PipelineStage,
    pub unread_count: u32,
    pub owner_instance: String, // Fixed at first discovery
    pub discovery_index: u64,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub provider_id: Option<String>, // Id assigned by the gateway, when known
    pub text: String,
    pub direction: Direction,
    pub sent_at: u64, // Seconds since the epoch
    pub delivery_status: DeliveryStatus,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sent = 1,      // Accepted by the gateway
    Delivered = 2, // Reached the recipient's device
    Read = 3,      // Read by the recipient
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
}

/// State of one pairing attempt for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingState {
    Idle,
    Provisioning,
    AwaitingScan,
    Paired,
    TimedOut,
    Terminated,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Paired | PairingState::TimedOut | PairingState::Terminated)
    }

    /// Whether the machine allows moving from `self` to `next`.
    ///
    /// Any state may be terminated. A finished attempt (paired or timed out)
    /// may re-enter provisioning to pair again; a terminated one may only be
    /// restarted by a fresh create.
    pub fn can_transition(self, next: PairingState) -> bool {
        use PairingState::*;
        match (self, next) {
            (_, Terminated) => true,
            (Idle, Provisioning) => true,
            (Provisioning, Provisioning) => true, // Retry after a failed connect
            (Provisioning, AwaitingScan) => true,
            (Provisioning, Paired) => true,
            (AwaitingScan, Provisioning) => true,
            (AwaitingScan, Paired) => true,
            (AwaitingScan, TimedOut) => true,
            (Provisioning, TimedOut) => true,
            (Paired, Provisioning) | (TimedOut, Provisioning) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PairingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PairingState::Idle => "idle",
            PairingState::Provisioning => "provisioning",
            PairingState::AwaitingScan => "awaiting-scan",
            PairingState::Paired => "paired",
            PairingState::TimedOut => "timed-out",
            PairingState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}
