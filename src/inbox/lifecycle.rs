// Connection lifecycle
// Drives pairing for one instance at a time per name:
// IDLE -> PROVISIONING -> AWAITING_SCAN -> PAIRED, with TIMED_OUT and
// TERMINATED as the other ends.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::registry::{InstanceObserver, InstanceRegistry, StatusTable};
use super::InboxError;
use crate::gateway::{GatewayApi, PairingTicket};
use crate::models::{GatewayInstance, InstanceStatus, PairingState};

#[derive(Debug, Clone, PartialEq)]
pub struct PairingSession {
    pub instance: String,
    pub state: PairingState,
    pub ticket: Option<PairingTicket>, // Only present while awaiting a scan
    pub attempt: u64,
    pub started_at: Instant,
    pub deadline: Instant,
    saw_offline: bool, // Instance observed not connected since the attempt began
}

impl PairingSession {
    pub fn qr_code(&self) -> Option<&str> {
        self.ticket.as_ref().and_then(|t| t.qr_code.as_deref())
    }
}

/// Pairing sessions keyed by instance name. Registered with the registry so
/// status flips complete pairings.
struct SessionBoard {
    sessions_tx: watch::Sender<HashMap<String, PairingSession>>,
}

impl SessionBoard {
    fn get(&self, name: &str) -> Option<PairingSession> {
        self.sessions_tx.borrow().get(name).cloned()
    }

    /// Begin a new attempt in PROVISIONING, invalidating any earlier one.
    fn start_attempt(&self, name: &str, attempt: u64, timeout: Duration, saw_offline: bool) -> PairingSession {
        let now = Instant::now();
        let session = PairingSession {
            instance: name.to_string(),
            state: PairingState::Provisioning,
            ticket: None,
            attempt,
            started_at: now,
            deadline: now + timeout,
            saw_offline,
        };
        self.sessions_tx.send_modify(|sessions| {
            sessions.insert(name.to_string(), session.clone());
        });
        session
    }

    /// Apply a transition for `attempt`. Results for superseded attempts are dropped.
    fn apply(
        &self,
        name: &str,
        attempt: Option<u64>,
        next: PairingState,
        ticket: Option<PairingTicket>,
    ) -> Result<PairingSession, InboxError> {
        let mut outcome = Err(InboxError::UnknownInstance(name.to_string()));
        self.sessions_tx.send_if_modified(|sessions| {
            let Some(session) = sessions.get_mut(name) else {
                return false;
            };
            if attempt.is_some_and(|a| a != session.attempt) {
                debug!("Dropping result of superseded pairing attempt for {}", name);
                outcome = Err(InboxError::PairingTerminated(name.to_string()));
                return false;
            }
            if !session.state.can_transition(next) {
                outcome = Err(InboxError::InvalidTransition {
                    instance: name.to_string(),
                    from: session.state,
                    to: next,
                });
                return false;
            }
            info!("Pairing {}: {} -> {}", name, session.state, next);
            session.state = next;
            session.ticket = if next == PairingState::AwaitingScan { ticket } else { None };
            outcome = Ok(session.clone());
            true
        });
        outcome
    }

    fn remove(&self, name: &str, attempt: u64) {
        self.sessions_tx.send_if_modified(|sessions| {
            if sessions.get(name).is_some_and(|s| s.attempt == attempt) {
                sessions.remove(name);
                true
            } else {
                false
            }
        });
    }

    fn expire_overdue(&self, now: Instant) {
        self.sessions_tx.send_if_modified(|sessions| {
            let mut changed = false;
            for session in sessions.values_mut() {
                let waiting = matches!(session.state, PairingState::Provisioning | PairingState::AwaitingScan);
                if waiting && now >= session.deadline {
                    warn!("Pairing {} timed out in {}", session.instance, session.state);
                    session.state = PairingState::TimedOut;
                    session.ticket = None;
                    changed = true;
                }
            }
            changed
        });
    }
}

impl InstanceObserver for SessionBoard {
    fn instances_refreshed(&self, instances: &[GatewayInstance]) {
        self.expire_overdue(Instant::now());
        self.sessions_tx.send_if_modified(|sessions| {
            let mut changed = false;
            for session in sessions.values_mut() {
                if session.state.is_terminal() {
                    continue;
                }
                let status = instances
                    .iter()
                    .find(|i| i.name == session.instance)
                    .map(|i| i.status)
                    .unwrap_or(InstanceStatus::Disconnected);
                if status != InstanceStatus::Connected {
                    session.saw_offline = true;
                } else if session.state == PairingState::AwaitingScan && session.saw_offline {
                    info!("Pairing {}: scan confirmed, instance connected", session.instance);
                    session.state = PairingState::Paired;
                    session.ticket = None;
                    changed = true;
                }
            }
            changed
        });
    }
}

pub struct ConnectionLifecycleManager {
    api: Arc<dyn GatewayApi>,
    registry: Arc<InstanceRegistry>,
    table: StatusTable,
    pairing_timeout: Duration,
    board: Arc<SessionBoard>,
    next_attempt: AtomicU64,
}

impl ConnectionLifecycleManager {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        registry: Arc<InstanceRegistry>,
        table: StatusTable,
        pairing_timeout: Duration,
    ) -> Self {
        let (sessions_tx, _) = watch::channel(HashMap::new());
        let board = Arc::new(SessionBoard { sessions_tx });
        registry.add_observer(board.clone());
        Self {
            api,
            registry,
            table,
            pairing_timeout,
            board,
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn session(&self, name: &str) -> Option<PairingSession> {
        self.board.get(name)
    }

    pub fn subscribe(&self) -> watch::Receiver<HashMap<String, PairingSession>> {
        self.board.sessions_tx.subscribe()
    }

    fn begin(&self, name: &str) -> PairingSession {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let online_now = self.registry.get(name).is_some_and(|i| i.is_connected());
        self.board.start_attempt(name, attempt, self.pairing_timeout, !online_now)
    }

    /// Move a fresh attempt forward from what the gateway handed back.
    fn settle(&self, name: &str, attempt: u64, ticket: PairingTicket) -> Result<PairingSession, InboxError> {
        if ticket.has_qr() {
            return self.board.apply(name, Some(attempt), PairingState::AwaitingScan, Some(ticket));
        }
        let reported = ticket.state.as_deref().map(|s| self.table.classify(s));
        if reported == Some(InstanceStatus::Connected) {
            return self.board.apply(name, Some(attempt), PairingState::Paired, None);
        }
        warn!("Gateway returned no pairing code for {} (state {:?})", name, ticket.state);
        self.board
            .get(name)
            .filter(|s| s.attempt == attempt)
            .ok_or_else(|| InboxError::PairingTerminated(name.to_string()))
    }

    /// Create an instance on the gateway and start pairing it.
    pub async fn create_instance(&self, name: &str) -> Result<PairingSession, InboxError> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(InboxError::InvalidInstanceName(name.to_string()));
        }
        if let Some(existing) = self.board.get(name) {
            if !existing.state.is_terminal() {
                return Err(InboxError::InvalidTransition {
                    instance: name.to_string(),
                    from: existing.state,
                    to: PairingState::Provisioning,
                });
            }
        }

        self.registry.revive(name);
        let session = self.begin(name);
        let ticket = match self.api.create_instance(name).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("Creating instance {} failed: {}", name, e);
                self.board.remove(name, session.attempt);
                return Err(e.into());
            }
        };

        // Some gateways hand the QR back with the create call; others need a connect
        let settled = if ticket.has_qr() || self.is_online(&ticket) {
            self.settle(name, session.attempt, ticket)
        } else {
            self.fetch_qr(name, session.attempt).await
        };
        // The instance exists on the gateway even if no QR came back
        self.registry.refresh().await;
        let settled = settled?;
        Ok(self.board.get(name).unwrap_or(settled))
    }

    fn is_online(&self, ticket: &PairingTicket) -> bool {
        ticket.state.as_deref().map(|s| self.table.classify(s)) == Some(InstanceStatus::Connected)
    }

    /// Request (or re-request) a pairing QR. Any earlier QR is invalidated.
    ///
    /// A terminated instance has to be created again instead.
    pub async fn request_qr(&self, name: &str) -> Result<PairingSession, InboxError> {
        if let Some(current) = self.board.get(name) {
            if !current.state.can_transition(PairingState::Provisioning) {
                return Err(InboxError::InvalidTransition {
                    instance: name.to_string(),
                    from: current.state,
                    to: PairingState::Provisioning,
                });
            }
            info!("Re-pairing {} (was {})", name, current.state);
        }
        let session = self.begin(name);
        self.fetch_qr(name, session.attempt).await
    }

    async fn fetch_qr(&self, name: &str, attempt: u64) -> Result<PairingSession, InboxError> {
        let ticket = self.api.connect_instance(name).await.map_err(|e| {
            warn!("Requesting pairing QR for {} failed: {}", name, e);
            InboxError::from(e)
        })?;
        self.settle(name, attempt, ticket)
    }

    /// Delete the instance on the gateway, terminate its pairing and drop it
    /// from the registry.
    pub async fn delete_instance(&self, name: &str) -> Result<(), InboxError> {
        self.api.delete_instance(name).await?;

        if self.board.get(name).is_none() {
            self.begin(name);
        }
        self.board.apply(name, None, PairingState::Terminated, None)?;
        self.registry.forget(name);
        self.registry.refresh().await;
        Ok(())
    }

    /// Abandon the current attempt without touching the gateway.
    pub fn cancel(&self, name: &str) -> Result<PairingSession, InboxError> {
        self.board.apply(name, None, PairingState::Terminated, None)
    }

    /// Wait for the current attempt to finish, bounded by its deadline.
    pub async fn wait_for_pairing(&self, name: &str) -> Result<PairingSession, InboxError> {
        let mut rx = self.board.sessions_tx.subscribe();
        loop {
            let session = rx
                .borrow_and_update()
                .get(name)
                .cloned()
                .ok_or_else(|| InboxError::UnknownInstance(name.to_string()))?;

            match session.state {
                PairingState::Paired => return Ok(session),
                PairingState::TimedOut => {
                    return Err(InboxError::PairingTimeout {
                        instance: name.to_string(),
                        waited: session.deadline - session.started_at,
                    })
                }
                PairingState::Terminated => return Err(InboxError::PairingTerminated(name.to_string())),
                _ => {}
            }

            match tokio::time::timeout_at(session.deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(InboxError::PairingTerminated(name.to_string())),
                Err(_) => {
                    self.board.expire_overdue(Instant::now());
                    // Loop once more to report whatever the expiry left behind
                }
            }
        }
    }
}
