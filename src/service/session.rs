//! Connected-session bookkeeping. A session is either a device (keyed by
//! serial, at most one live session per serial) or an operator console (any
//! number). Outbound frames go through a per-session channel drained by the
//! connection's writer task, so one slow or dead peer never blocks another.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Unknown,
    Device,
    Operator,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    pub fn new(id: u64, peer: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, peer, outbound }
    }

    /// Queue a JSON frame. Failure means the connection is already gone;
    /// callers treat that as a transient condition.
    pub fn send(&self, frame: &Value) -> bool {
        self.outbound
            .send(Message::Text(frame.to_string()))
            .is_ok()
    }

    pub fn send_raw(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Ask the writer task to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, SessionHandle>,
    operators: HashMap<u64, SessionHandle>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bind a device serial to a session. A previous session for the same
    /// serial is closed and superseded.
    pub async fn register_device(&self, serial: &str, session: SessionHandle) {
        let mut inner = self.inner.write().await;
        let new_id = session.id;
        if let Some(old) = inner.devices.insert(serial.to_string(), session) {
            // A repeated reg on the same connection is not a reconnect
            if old.id != new_id {
                tracing::info!(serial, old_session = old.id, "device reconnected, closing prior session");
                old.close();
            }
        }
    }

    pub async fn register_operator(&self, session: SessionHandle) {
        let mut inner = self.inner.write().await;
        inner.operators.insert(session.id, session);
    }

    /// Drop a session from both tables. Returns the device serial that was
    /// bound to it, if any, so the caller can cancel a pending enrollment.
    pub async fn unregister(&self, session_id: u64) -> Option<String> {
        let mut inner = self.inner.write().await;
        inner.operators.remove(&session_id);

        let serial = inner
            .devices
            .iter()
            .find(|(_, handle)| handle.id == session_id)
            .map(|(serial, _)| serial.clone());
        if let Some(serial) = &serial {
            inner.devices.remove(serial);
        }
        serial
    }

    pub async fn is_device_connected(&self, serial: &str) -> bool {
        self.inner.read().await.devices.contains_key(serial)
    }

    pub async fn device(&self, serial: &str) -> Option<SessionHandle> {
        self.inner.read().await.devices.get(serial).cloned()
    }

    pub async fn list_device_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.inner.read().await.devices.keys().cloned().collect();
        serials.sort();
        serials
    }

    pub async fn device_handles(&self) -> Vec<SessionHandle> {
        self.inner.read().await.devices.values().cloned().collect()
    }

    pub async fn operator_count(&self) -> usize {
        self.inner.read().await.operators.len()
    }

    pub async fn operator_handles(&self) -> Vec<SessionHandle> {
        self.inner.read().await.operators.values().cloned().collect()
    }

    /// Send a frame to every operator console. Dead sessions are skipped.
    pub async fn broadcast_to_operators(&self, frame: &Value) {
        let operators: Vec<SessionHandle> = {
            let inner = self.inner.read().await;
            inner.operators.values().cloned().collect()
        };

        for operator in operators {
            if !operator.send(frame) {
                tracing::debug!(session = operator.id, "operator send failed, skipping");
            }
        }
    }
}
