// Common test utilities for integration tests
// A scriptable in-memory gateway plus builders for its payloads
#![allow(dead_code)]

use async_trait::async_trait;
use log::LevelFilter;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::Notify;

use switchboard::gateway::{
    ChatEntry, GatewayApi, GatewayError, MessageRecord, PairingTicket, RawInstance, SendReceipt,
};
use switchboard::{Inbox, InboxSettings};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Holds one gateway call open until the test releases it.
#[derive(Default)]
pub struct Gate {
    started: Notify,
    release: Notify,
}

impl Gate {
    /// Resolves once the gated call has reached the gateway.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.started.notify_one();
        self.release.notified().await;
    }
}

fn unavailable(path: &str) -> GatewayError {
    GatewayError::Status {
        status: 503,
        path: path.to_string(),
        body: "service unavailable".to_string(),
    }
}

#[derive(Default)]
struct MockState {
    instances: Vec<RawInstance>,
    instances_down: bool,
    chats: HashMap<String, Vec<ChatEntry>>,
    failing_chats: Vec<String>,
    histories: HashMap<String, Vec<MessageRecord>>,
    ignores_history_limit: bool,
    create_ticket: PairingTicket,
    create_fails: bool,
    connect_fails: bool,
    connect_ticket: Option<PairingTicket>,
    qr_counter: u32,
    send_fails: bool,
    send_ids: Vec<String>,
    sent: Vec<(String, String, String)>,
    calls: HashMap<String, usize>,
}

/// In-memory gateway driven entirely by the test.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    instance_gate: Mutex<Option<Arc<Gate>>>,
    history_gates: Mutex<HashMap<String, Arc<Gate>>>,
    chat_gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn count(&self, call: String) {
        self.with_state(|s| *s.calls.entry(call).or_default() += 1);
    }

    /// Replace the instance list with (name, raw status) pairs.
    pub fn set_instances(&self, instances: &[(&str, &str)]) {
        let list = instances.iter().map(|(name, status)| raw_instance(name, status)).collect();
        self.with_state(|s| s.instances = list);
    }

    pub fn set_status(&self, name: &str, status: &str) {
        self.with_state(|s| {
            match s.instances.iter_mut().find(|i| i.name == name) {
                Some(instance) => instance.status = status.to_string(),
                None => s.instances.push(raw_instance(name, status)),
            }
        });
    }

    pub fn set_instances_down(&self, down: bool) {
        self.with_state(|s| s.instances_down = down);
    }

    pub fn set_chats(&self, instance: &str, chats: Vec<ChatEntry>) {
        self.with_state(|s| {
            s.failing_chats.retain(|name| name != instance);
            s.chats.insert(instance.to_string(), chats);
        });
    }

    pub fn fail_chats(&self, instance: &str) {
        self.with_state(|s| s.failing_chats.push(instance.to_string()));
    }

    /// History for a chat, newest first as the gateway returns it.
    pub fn set_history(&self, remote_jid: &str, records: Vec<MessageRecord>) {
        self.with_state(|s| {
            s.histories.insert(remote_jid.to_string(), records);
        });
    }

    /// Return whole histories regardless of the requested count.
    pub fn set_ignores_history_limit(&self, ignores: bool) {
        self.with_state(|s| s.ignores_history_limit = ignores);
    }

    pub fn set_create_ticket(&self, ticket: PairingTicket) {
        self.with_state(|s| s.create_ticket = ticket);
    }

    pub fn fail_create(&self) {
        self.with_state(|s| s.create_fails = true);
    }

    pub fn set_connect_fails(&self, fails: bool) {
        self.with_state(|s| s.connect_fails = fails);
    }

    /// Fixed connect response. Without one, every connect hands out a new
    /// QR: qr-1, qr-2, ...
    pub fn set_connect_ticket(&self, ticket: PairingTicket) {
        self.with_state(|s| s.connect_ticket = Some(ticket));
    }

    pub fn set_send_fails(&self, fails: bool) {
        self.with_state(|s| s.send_fails = fails);
    }

    /// Provider ids handed out by successive sends; once exhausted, sends
    /// return no id.
    pub fn queue_send_ids(&self, ids: &[&str]) {
        self.with_state(|s| s.send_ids.extend(ids.iter().map(|id| id.to_string())));
    }

    /// Hold the next instance fetch until the returned gate is released.
    pub fn hold_instances(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.instance_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Hold the next history fetch for `remote_jid`.
    pub fn hold_history(&self, remote_jid: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.history_gates.lock().unwrap().insert(remote_jid.to_string(), gate.clone());
        gate
    }

    /// Hold the next chat list fetch from `instance`.
    pub fn hold_chats(&self, instance: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.chat_gates.lock().unwrap().insert(instance.to_string(), gate.clone());
        gate
    }

    /// Number of calls made, keyed like "find_chats:shop-1" or "fetch_instances".
    pub fn calls(&self, key: &str) -> usize {
        self.with_state(|s| s.calls.get(key).copied().unwrap_or(0))
    }

    /// (instance, remote jid, text) of every send that reached the gateway.
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.with_state(|s| s.sent.clone())
    }
}

#[async_trait]
impl GatewayApi for MockGateway {
    async fn fetch_instances(&self) -> Result<Vec<RawInstance>, GatewayError> {
        self.count("fetch_instances".to_string());
        let gate = self.instance_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.with_state(|s| {
            if s.instances_down {
                Err(unavailable("/instance/fetchInstances"))
            } else {
                Ok(s.instances.clone())
            }
        })
    }

    async fn create_instance(&self, name: &str) -> Result<PairingTicket, GatewayError> {
        self.count(format!("create_instance:{}", name));
        self.with_state(|s| {
            if s.create_fails {
                return Err(unavailable("/instance/create"));
            }
            if !s.instances.iter().any(|i| i.name == name) {
                s.instances.push(raw_instance(name, "connecting"));
            }
            Ok(s.create_ticket.clone())
        })
    }

    async fn connect_instance(&self, name: &str) -> Result<PairingTicket, GatewayError> {
        self.count(format!("connect_instance:{}", name));
        self.with_state(|s| {
            if s.connect_fails {
                return Err(unavailable("/instance/connect"));
            }
            if let Some(ticket) = &s.connect_ticket {
                return Ok(ticket.clone());
            }
            s.qr_counter += 1;
            Ok(qr_ticket(&format!("qr-{}", s.qr_counter)))
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<(), GatewayError> {
        self.count(format!("delete_instance:{}", name));
        Ok(())
    }

    async fn find_chats(&self, instance: &str) -> Result<Vec<ChatEntry>, GatewayError> {
        self.count(format!("find_chats:{}", instance));
        let gate = self.chat_gates.lock().unwrap().remove(instance);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.with_state(|s| {
            if s.failing_chats.iter().any(|name| name == instance) {
                return Err(unavailable("/chat/findChats"));
            }
            Ok(s.chats.get(instance).cloned().unwrap_or_default())
        })
    }

    async fn fetch_messages(
        &self,
        instance: &str,
        remote_jid: &str,
        count: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        self.count(format!("fetch_messages:{}", instance));
        let gate = self.history_gates.lock().unwrap().remove(remote_jid);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.with_state(|s| {
            let mut records = s.histories.get(remote_jid).cloned().unwrap_or_default();
            if !s.ignores_history_limit {
                records.truncate(count);
            }
            Ok(records)
        })
    }

    async fn send_text(
        &self,
        instance: &str,
        remote_jid: &str,
        text: &str,
    ) -> Result<SendReceipt, GatewayError> {
        self.count(format!("send_text:{}", instance));
        self.with_state(|s| {
            if s.send_fails {
                return Err(unavailable("/message/sendText"));
            }
            s.sent.push((instance.to_string(), remote_jid.to_string(), text.to_string()));
            let provider_id = if s.send_ids.is_empty() { None } else { Some(s.send_ids.remove(0)) };
            Ok(SendReceipt { provider_id, timestamp: None })
        })
    }
}

pub fn raw_instance(name: &str, status: &str) -> RawInstance {
    RawInstance {
        id: format!("id-{}", name),
        name: name.to_string(),
        status: status.to_string(),
        phone_number: None,
    }
}

pub fn chat(remote_jid: &str, name: &str, last_text: &str, unread: u32) -> ChatEntry {
    ChatEntry {
        remote_jid: Some(remote_jid.to_string()),
        name: Some(name.to_string()),
        last_message: Some(json!({ "conversation": last_text })),
        unread_count: unread,
    }
}

pub fn text_record(id: &str, timestamp: u64, from_me: bool, text: &str) -> MessageRecord {
    MessageRecord {
        id: Some(id.to_string()),
        from_me,
        timestamp: Some(timestamp),
        status: None,
        message_type: Some("conversation".to_string()),
        body: json!({ "conversation": text }),
    }
}

pub fn qr_ticket(code: &str) -> PairingTicket {
    PairingTicket {
        qr_code: Some(code.to_string()),
        ..PairingTicket::default()
    }
}

pub fn inbox_with(mock: &Arc<MockGateway>, settings: InboxSettings) -> Inbox {
    setup_logging();
    let api: Arc<dyn GatewayApi> = mock.clone();
    Inbox::new(api, settings)
}

pub fn inbox(mock: &Arc<MockGateway>) -> Inbox {
    inbox_with(mock, InboxSettings::default())
}
