//! Observer state and broadcast hub.
//!
//! Each observer owns an unbounded channel feeding its WebSocket write
//! task, so a slow socket never blocks the broadcaster. The hub serializes
//! each update once and walks a snapshot of the set; a failed send prunes
//! that observer and the iteration continues.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use crate::registry::{DeviceRegistry, DeviceState};
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique observer identifier.
pub type ObserverId = Uuid;

/// One connected observer.
pub struct ObserverState {
    pub id: ObserverId,
    /// Channel to the observer's socket write task.
    pub tx: mpsc::UnboundedSender<Message>,
    pub connected_at: DateTime<Utc>,
}

impl ObserverState {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: Utc::now(),
        }
    }

    /// Serialize and send one message to this observer.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }
}

/// Registry of connected observers; the broadcast hub.
pub struct ObserverRegistry {
    observers: DashMap<ObserverId, Arc<ObserverState>>,
    devices: Arc<DeviceRegistry>,
}

impl ObserverRegistry {
    pub fn new(devices: Arc<DeviceRegistry>) -> Self {
        Self {
            observers: DashMap::new(),
            devices,
        }
    }

    /// Register an observer. The current registry snapshot goes out as a
    /// single `initial_state` message before the observer joins the
    /// broadcast set, so its first message is always the snapshot.
    pub fn register(&self, observer: Arc<ObserverState>) -> Result<ObserverId> {
        let id = observer.id;

        observer.send(&ServerMessage::InitialState {
            data: self.devices.snapshot(),
        })?;

        self.observers.insert(id, observer);
        counter!("gateway_observer_connections_total").increment(1);
        gauge!("gateway_active_observers").set(self.observers.len() as f64);
        info!(observer = %id, "observer registered");
        Ok(id)
    }

    /// Remove an observer; it is never sent to again.
    pub fn unregister(&self, id: &ObserverId) {
        if self.observers.remove(id).is_some() {
            gauge!("gateway_active_observers").set(self.observers.len() as f64);
            info!(observer = %id, "observer unregistered");
        }
    }

    /// Deliver one update to every observer.
    ///
    /// The message is serialized once; individual failures are counted and
    /// the failing observer pruned without aborting the iteration.
    pub fn broadcast(&self, update: &DeviceState) {
        let json = match serde_json::to_string(&ServerMessage::Update {
            data: update.clone(),
        }) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return;
            }
        };

        let targets: Vec<Arc<ObserverState>> = self
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for observer in targets {
            if observer.tx.send(Message::Text(json.clone().into())).is_err() {
                counter!("gateway_broadcast_errors_total").increment(1);
                warn!(observer = %observer.id, "observer send failed, pruning");
                self.unregister(&observer.id);
            } else {
                debug!(observer = %observer.id, imei = %update.imei, "update delivered");
            }
        }

        counter!("gateway_broadcasts_total").increment(1);
    }

    /// Number of connected observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
