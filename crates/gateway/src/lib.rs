//! Real-time ingestion gateway for GT06 vehicle GPS trackers.
//!
//! Trackers hold long-lived TCP sessions and stream binary frames (login,
//! location, heartbeat); the gateway decodes them, acknowledges each frame,
//! keeps the last-known state per device and fans updates out to map
//! observers over WebSocket. Observers can also inject synthetic updates
//! (simulation mode) through the same channel.
//!
//! ## Architecture
//!
//! ```text
//! tracker TCP (:5000)
//!         ↓
//! Gt06Codec / packet parser (gt06 crate)
//!         ↓
//! session handler (ACK, IMEI binding)
//!         ↓
//! DeviceRegistry ──► Dispatcher (per-IMEI FIFO, one drainer per IMEI)
//!         ↑                  ↓
//!         │          ObserverRegistry (broadcast hub)
//!         │                  ↓
//! observer WebSocket (:8081) ⇅ synthetic updates
//! ```
//!
//! ## Ordering guarantees
//!
//! - Per IMEI: strict FIFO from enqueue order to observer delivery order.
//! - Across IMEIs: none; queues drain in parallel.
//! - Per observer: receive order equals broadcast-invocation order.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingress;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tcp_server;
pub mod ws_server;

pub use config::{Config, LogFormat};
pub use dispatch::{Dispatcher, QueuedUpdate};
pub use error::{GatewayError, Result};
pub use ingress::Ingress;
pub use observer::{ObserverId, ObserverRegistry, ObserverState};
pub use protocol::{InboundFrame, ServerMessage};
pub use registry::{DeviceRegistry, DeviceState, DeviceStatus};
pub use session::SessionContext;
pub use ws_server::{create_router, AppState};
