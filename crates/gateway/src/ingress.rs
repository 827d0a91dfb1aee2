//! Shared ingress into the registry and dispatch queue.
//!
//! Two paths feed the gateway: device sessions (login, location,
//! disconnect) and observer-injected synthetic updates. Both commit to the
//! registry first and enqueue the merged snapshot second, so the registry
//! always reflects an update before any observer sees it broadcast.

use crate::dispatch::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::registry::{DeviceRegistry, DeviceState, DeviceStatus};
use chrono::Utc;
use gt06::LocationFix;
use std::sync::Arc;

/// Handle on the two shared stores, cloned into each connection task.
#[derive(Clone)]
pub struct Ingress {
    pub registry: Arc<DeviceRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Ingress {
    pub fn new(registry: Arc<DeviceRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// A device logged in: create or reuse its entry, preserving any prior
    /// coordinates. Not broadcast; observers learn about the device with
    /// its first location.
    pub fn device_login(&self, imei: &str) -> DeviceState {
        self.registry.upsert_with(imei, |d| {
            d.status = DeviceStatus::Active;
        })
    }

    /// A device reported a location fix: merge, stamp the receive time and
    /// queue the snapshot for broadcast.
    pub fn device_fix(&self, imei: &str, fix: &LocationFix) -> DeviceState {
        let merged = self.registry.upsert_with(imei, |d| {
            d.lat = Some(fix.lat);
            d.lon = Some(fix.lon);
            d.speed = fix.speed;
            d.course = fix.course;
            d.satellites = fix.satellites;
            d.realtime_gps = fix.realtime_gps;
            d.payload_time = Some(fix.timestamp);
            d.received_time = Some(Utc::now());
            d.status = DeviceStatus::Active;
        });

        self.dispatcher.enqueue(merged.clone());
        merged
    }

    /// A device session closed: flip the entry offline and queue one final
    /// update so observers learn about the transition.
    pub fn device_offline(&self, imei: &str) -> DeviceState {
        let merged = self.registry.upsert_with(imei, |d| {
            d.status = DeviceStatus::Offline;
        });

        self.dispatcher.enqueue(merged.clone());
        merged
    }

    /// An observer injected a synthetic update (simulation mode). Treated
    /// exactly like a device-originated location for the carried IMEI:
    /// merge into the registry, then enqueue.
    pub fn synthetic(&self, incoming: DeviceState) -> Result<DeviceState> {
        if incoming.imei.len() != 15 || !incoming.imei.bytes().all(|b| b.is_ascii_digit()) {
            return Err(GatewayError::ObserverPayload(format!(
                "imei must be 15 decimal digits, got {:?}",
                incoming.imei
            )));
        }

        let merged = self.registry.upsert_with(&incoming.imei, |d| {
            if incoming.lat.is_some() {
                d.lat = incoming.lat;
            }
            if incoming.lon.is_some() {
                d.lon = incoming.lon;
            }
            d.speed = incoming.speed;
            d.course = incoming.course;
            d.satellites = incoming.satellites;
            d.realtime_gps = incoming.realtime_gps;
            d.payload_time = incoming.payload_time.or_else(|| Some(Utc::now()));
            d.received_time = Some(Utc::now());
            d.status = DeviceStatus::Active;
        });

        self.dispatcher.enqueue(merged.clone());
        Ok(merged)
    }
}
