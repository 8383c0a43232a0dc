// Message body normalization
// Turns the gateway's per-type message objects into text + content type

use serde_json::Value;

use crate::models::{ContentType, DeliveryStatus, Direction};

pub const IMAGE_PLACEHOLDER: &str = "[Image]";
pub const AUDIO_PLACEHOLDER: &str = "[Audio]";
pub const VIDEO_PLACEHOLDER: &str = "[Video]";
pub const UNSUPPORTED_PLACEHOLDER: &str = "[Unsupported message]";

fn text_at<'a>(body: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut node = body;
    for key in path {
        node = node.get(*key)?;
    }
    node.as_str().filter(|s| !s.trim().is_empty())
}

/// Normalize a message body into (content type, display text).
///
/// Plain and extended text keep their text; media keep a caption when one
/// exists and otherwise degrade to a placeholder label.
pub fn message_body(body: &Value) -> (ContentType, String) {
    if let Some(text) = body.as_str().filter(|s| !s.trim().is_empty()) {
        return (ContentType::Text, text.to_string());
    }
    if let Some(text) = text_at(body, &["conversation"]) {
        return (ContentType::Text, text.to_string());
    }
    if let Some(text) = text_at(body, &["extendedTextMessage", "text"]) {
        return (ContentType::Text, text.to_string());
    }
    if body.get("imageMessage").is_some() {
        let text = text_at(body, &["imageMessage", "caption"]).unwrap_or(IMAGE_PLACEHOLDER);
        return (ContentType::Image, text.to_string());
    }
    if body.get("videoMessage").is_some() {
        let text = text_at(body, &["videoMessage", "caption"]).unwrap_or(VIDEO_PLACEHOLDER);
        return (ContentType::Video, text.to_string());
    }
    if body.get("audioMessage").is_some() {
        return (ContentType::Audio, AUDIO_PLACEHOLDER.to_string());
    }
    (ContentType::Text, UNSUPPORTED_PLACEHOLDER.to_string())
}

/// Map the gateway's ack label onto our delivery status.
///
/// Inbound messages reached us, so they are at least delivered.
pub fn delivery_status(raw: Option<&str>, direction: Direction) -> DeliveryStatus {
    let floor = match direction {
        Direction::Inbound => DeliveryStatus::Delivered,
        Direction::Outbound => DeliveryStatus::Sent,
    };
    let reported = match raw.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
        Some("READ") | Some("PLAYED") | Some("4") | Some("5") => DeliveryStatus::Read,
        Some("DELIVERY_ACK") | Some("DELIVERED") | Some("3") => DeliveryStatus::Delivered,
        _ => DeliveryStatus::Sent,
    };
    reported.max(floor)
}
