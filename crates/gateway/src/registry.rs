//! Last-known device state, keyed by IMEI.
//!
//! Uses DashMap for concurrent access from device sessions and observer
//! ingress. Writes are atomic at the entry granularity; a snapshot never
//! observes a partially written state. Per-key delivery ordering is the
//! dispatcher's job, not the registry's.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Whether the device currently holds a live session.
///
/// `Offline` is written only by session teardown, never by ordinary
/// updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Active,
    Offline,
}

/// Last-known state of a single tracker.
///
/// The wire shape (observer JSON) and the registry entry are the same
/// struct; optional fields stay absent until the first location fix and are
/// never cleared afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// 15-digit IMEI, immutable for the life of the process.
    pub imei: String,
    /// Latitude in decimal degrees, absent before the first fix.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lat: Option<f64>,
    /// Longitude in decimal degrees, absent before the first fix.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lon: Option<f64>,
    /// Speed in km/h, 0-255.
    #[serde(default)]
    pub speed: u8,
    /// Course over ground in degrees, 0-359.
    #[serde(default)]
    pub course: u16,
    /// Satellites used for the last fix, 0-15.
    #[serde(default)]
    pub satellites: u8,
    #[serde(rename = "realtimeGps", default)]
    pub realtime_gps: bool,
    /// Device-reported UTC instant of the last fix.
    #[serde(rename = "datetime", skip_serializing_if = "Option::is_none", default)]
    pub payload_time: Option<DateTime<Utc>>,
    /// When the gateway parsed the last packet for this device.
    #[serde(
        rename = "receivedTime",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub received_time: Option<DateTime<Utc>>,
    /// Instant of the last registry write.
    #[serde(rename = "lastUpdate", default = "Utc::now")]
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub status: DeviceStatus,
}

impl DeviceState {
    /// Fresh entry for a device that has logged in but not yet reported.
    pub fn new(imei: impl Into<String>) -> Self {
        Self {
            imei: imei.into(),
            lat: None,
            lon: None,
            speed: 0,
            course: 0,
            satellites: 0,
            realtime_gps: false,
            payload_time: None,
            received_time: None,
            last_update: Utc::now(),
            status: DeviceStatus::Active,
        }
    }
}

/// Concurrent map of IMEI to last-known state.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
        }
    }

    /// Idempotent creation: returns the existing state or inserts a fresh
    /// one.
    pub fn get_or_create(&self, imei: &str) -> DeviceState {
        self.devices
            .entry(imei.to_string())
            .or_insert_with(|| DeviceState::new(imei))
            .value()
            .clone()
    }

    /// Current state for one device, if known.
    pub fn get(&self, imei: &str) -> Option<DeviceState> {
        self.devices.get(imei).map(|entry| entry.value().clone())
    }

    /// Atomic per-key read-modify-write. Creates the entry if missing,
    /// applies `f`, stamps `last_update` and returns the merged snapshot.
    pub fn upsert_with<F>(&self, imei: &str, f: F) -> DeviceState
    where
        F: FnOnce(&mut DeviceState),
    {
        let mut entry = self
            .devices
            .entry(imei.to_string())
            .or_insert_with(|| DeviceState::new(imei));
        f(entry.value_mut());
        entry.last_update = Utc::now();
        entry.value().clone()
    }

    /// Point-in-time copy of every known device, for new-observer
    /// onboarding.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        self.devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
