//! Observer wire protocol.
//!
//! One JSON document per WebSocket text frame:
//!
//! - `{"type":"initial_state","data":[DeviceState,…]}` — server to a new
//!   observer, exactly once.
//! - `{"type":"update","data":DeviceState}` — server to observer on each
//!   broadcast, and observer to server as a synthetic ingress for
//!   `data.imei` (simulation mode).
//!
//! Any other `type` from an observer is ignored.

use crate::registry::DeviceState;
use serde::{Deserialize, Serialize};

/// Message sent from the gateway to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full registry snapshot, sent once on registration.
    InitialState { data: Vec<DeviceState> },
    /// One device changed.
    Update { data: DeviceState },
}

/// Raw inbound observer frame; the payload stays untyped until the kind is
/// known so unknown kinds can be ignored without a parse error.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundFrame {
    /// Device states carried by this frame, if it is an ingress kind.
    ///
    /// `update` carries one state; `initial_state` may carry one or an
    /// array. Returns `None` for kinds that are not ingress.
    pub fn ingress_states(self) -> Option<Result<Vec<DeviceState>, serde_json::Error>> {
        match self.kind.as_str() {
            "update" | "initial_state" => Some(match self.data {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<_>, _>>(),
                value => serde_json::from_value(value).map(|state| vec![state]),
            }),
            _ => None,
        }
    }
}
