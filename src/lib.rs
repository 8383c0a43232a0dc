// Gateway aggregation and conversation sync core
pub mod config;
pub mod gateway;
pub mod inbox;
pub mod models;

// Re-export main types for convenience
pub use gateway::{GatewayApi, GatewayClient, GatewayError};
pub use inbox::{Inbox, InboxError, InboxSettings};
pub use models::*;
