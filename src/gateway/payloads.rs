// Payload normalization for gateway responses
// The gateway answers with bare arrays or with the list wrapped in an object,
// depending on version and endpoint; everything is flattened here.

use serde_json::Value;

use super::{ChatEntry, MessageRecord, PairingTicket, RawInstance, SendReceipt};

/// Keys under which a list may be wrapped, tried in order.
const LIST_KEYS: &[&str] = &["data", "instances", "chats", "messages", "records"];

/// Extract the list from any supported envelope.
///
/// Returns `None` if the value is neither an array nor an object wrapping one.
pub fn unwrap_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            for key in LIST_KEYS {
                if let Some(inner) = map.remove(*key) {
                    match inner {
                        Value::Array(items) => return Some(items),
                        nested @ Value::Object(_) => {
                            if let Some(items) = unwrap_list(nested) {
                                return Some(items);
                            }
                        }
                        _ => {}
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn u64_field(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().filter_map(|key| value.get(*key)).find_map(as_u64_lenient)
}

/// Numbers sometimes arrive as strings.
fn as_u64_lenient(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse one instance entry, flat or nested under `instance`.
pub fn parse_instance(entry: &Value) -> Option<RawInstance> {
    let record = entry.get("instance").filter(|v| v.is_object()).unwrap_or(entry);

    let name = str_field(record, &["name", "instanceName"])?.to_string();
    let id = str_field(record, &["id", "instanceId"])
        .map(str::to_string)
        .unwrap_or_else(|| name.clone());
    let status = str_field(record, &["connectionStatus", "status", "state"])
        .unwrap_or_default()
        .to_string();
    let phone_number = str_field(record, &["number", "ownerJid", "owner"])
        .map(|raw| raw.split(['@', ':']).next().unwrap_or(raw).to_string())
        .filter(|s| !s.is_empty());

    Some(RawInstance { id, name, status, phone_number })
}

pub fn parse_chat(entry: &Value) -> ChatEntry {
    let remote_jid = str_field(entry, &["remoteJid", "jid", "id"]).map(str::to_string);
    let name = str_field(entry, &["pushName", "name", "subject"]).map(str::to_string);
    let last_message = entry
        .get("lastMessage")
        .filter(|v| !v.is_null())
        .map(|last| last.get("message").cloned().unwrap_or_else(|| last.clone()));
    let unread_count = u64_field(entry, &["unreadCount", "unreadMessages"])
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0);

    ChatEntry { remote_jid, name, last_message, unread_count }
}

pub fn parse_message(entry: &Value) -> MessageRecord {
    let key = entry.get("key");
    let id = key
        .and_then(|k| str_field(k, &["id"]))
        .or_else(|| str_field(entry, &["id"]))
        .map(str::to_string);
    let from_me = key
        .and_then(|k| k.get("fromMe"))
        .or_else(|| entry.get("fromMe"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let timestamp = u64_field(entry, &["messageTimestamp", "timestamp"]);
    let status = str_field(entry, &["status"])
        .map(str::to_string)
        .or_else(|| {
            // Newer gateways report acks as a list of updates; the last one wins
            entry
                .get("MessageUpdate")
                .and_then(Value::as_array)
                .and_then(|updates| updates.iter().rev().find_map(|u| str_field(u, &["status"])))
                .map(str::to_string)
        });
    let message_type = str_field(entry, &["messageType"]).map(str::to_string);
    let body = entry.get("message").cloned().unwrap_or(Value::Null);

    MessageRecord { id, from_me, timestamp, status, message_type, body }
}

/// Pairing material sits either at the top level or under `qrcode`.
pub fn parse_pairing(value: &Value) -> PairingTicket {
    let qr = value.get("qrcode").filter(|v| v.is_object()).unwrap_or(value);
    let state = value
        .get("instance")
        .and_then(|inst| str_field(inst, &["state", "status"]))
        .or_else(|| str_field(value, &["state"]))
        .map(str::to_string);

    PairingTicket {
        qr_code: str_field(qr, &["code"]).map(str::to_string),
        qr_image: str_field(qr, &["base64"]).map(str::to_string),
        pairing_code: str_field(qr, &["pairingCode"]).map(str::to_string),
        state,
    }
}

pub fn parse_send_receipt(value: &Value) -> SendReceipt {
    let provider_id = value
        .get("key")
        .and_then(|k| str_field(k, &["id"]))
        .or_else(|| str_field(value, &["id"]))
        .map(str::to_string);
    let timestamp = u64_field(value, &["messageTimestamp"]);
    SendReceipt { provider_id, timestamp }
}
