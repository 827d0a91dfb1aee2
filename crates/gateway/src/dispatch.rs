//! Per-IMEI update queue with an exclusive drainer.
//!
//! Devices burst (a simulation can push a point every 100 ms) and observers
//! can be slow; updating the registry and broadcasting synchronously would
//! drop or reorder updates whenever a broadcast is still in flight. Instead
//! every ingress appends to a per-IMEI FIFO and returns immediately. The
//! first append to an idle queue spawns a drainer task; at most one drainer
//! runs per IMEI at any instant, while different IMEIs drain in parallel.
//!
//! Sequence numbers are assigned inside the same critical section as the
//! append, so sequence order equals queue order equals delivery order.
//! The queue lock is never held across the broadcast call.

use crate::observer::ObserverRegistry;
use crate::registry::DeviceState;
use dashmap::DashMap;
use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// A snapshot awaiting broadcast.
#[derive(Debug, Clone)]
pub struct QueuedUpdate {
    /// Opaque per-process id, for tracing only.
    pub queue_id: Uuid,
    /// Monotonic per-IMEI sequence, starting at 1.
    pub seq: u64,
    pub state: DeviceState,
}

#[derive(Debug, Default)]
struct ImeiQueue {
    pending: VecDeque<QueuedUpdate>,
    draining: bool,
    next_seq: u64,
}

fn lock(queue: &Mutex<ImeiQueue>) -> MutexGuard<'_, ImeiQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes registry updates to observers, one FIFO per IMEI.
pub struct Dispatcher {
    queues: DashMap<String, Arc<Mutex<ImeiQueue>>>,
    observers: Arc<ObserverRegistry>,
    /// Pending cap per IMEI; the oldest entry drops on overflow.
    cap: usize,
    active_drainers: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(observers: Arc<ObserverRegistry>, cap: usize) -> Self {
        Self {
            queues: DashMap::new(),
            observers,
            cap,
            active_drainers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Append one update to its IMEI's queue and return the assigned
    /// sequence number. Never blocks on broadcast latency; if no drainer is
    /// running for this IMEI, one is spawned.
    pub fn enqueue(&self, state: DeviceState) -> u64 {
        let imei = state.imei.clone();
        let queue = Arc::clone(self.queues.entry(imei.clone()).or_default().value());

        let (seq, spawn_drainer) = {
            let mut q = lock(&queue);
            q.next_seq += 1;
            let seq = q.next_seq;
            q.pending.push_back(QueuedUpdate {
                queue_id: Uuid::new_v4(),
                seq,
                state,
            });

            if q.pending.len() > self.cap {
                let dropped = q.pending.pop_front();
                counter!("gateway_updates_dropped_total").increment(1);
                warn!(
                    imei = %imei,
                    seq = dropped.map(|u| u.seq),
                    "queue over capacity, dropped oldest update"
                );
            }

            let spawn_drainer = !q.draining;
            if spawn_drainer {
                q.draining = true;
            }
            (seq, spawn_drainer)
        };

        counter!("gateway_updates_enqueued_total").increment(1);

        if spawn_drainer {
            self.active_drainers.fetch_add(1, Ordering::SeqCst);
            let observers = self.observers.clone();
            let active = self.active_drainers.clone();
            tokio::spawn(async move {
                drain(queue, observers, imei).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        seq
    }

    /// Updates still waiting to be broadcast, across all IMEIs.
    pub fn pending_total(&self) -> usize {
        self.queues
            .iter()
            .map(|entry| lock(entry.value()).pending.len())
            .sum()
    }

    /// Drainer tasks currently running.
    pub fn active_drainers(&self) -> usize {
        self.active_drainers.load(Ordering::SeqCst)
    }

    /// Wait until every queue is empty and every drainer has finished, or
    /// the grace period elapses. Returns whether the queues fully drained.
    pub async fn drain_all(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;

        while Instant::now() < deadline {
            if self.pending_total() == 0 && self.active_drainers() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.pending_total() == 0 && self.active_drainers() == 0
    }
}

/// Pop and broadcast until the queue runs dry, then clear the draining
/// flag. An enqueue that arrives while this runs is picked up by the loop;
/// one that arrives after the flag clears spawns the next drainer.
async fn drain(queue: Arc<Mutex<ImeiQueue>>, observers: Arc<ObserverRegistry>, imei: String) {
    loop {
        let update = {
            let mut q = lock(&queue);
            match q.pending.pop_front() {
                Some(update) => update,
                None => {
                    q.draining = false;
                    break;
                }
            }
        };

        debug!(
            imei = %imei,
            seq = update.seq,
            queue_id = %update.queue_id,
            "broadcasting queued update"
        );
        observers.broadcast(&update.state);

        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ObserverState;
    use crate::registry::DeviceRegistry;
    use axum::extract::ws::Message;
    use serde_json::Value;
    use tokio::sync::mpsc;

    const IMEI_A: &str = "111111111111111";
    const IMEI_B: &str = "222222222222222";

    fn setup(cap: usize) -> (Arc<DeviceRegistry>, Arc<ObserverRegistry>, Dispatcher) {
        let devices = Arc::new(DeviceRegistry::new());
        let hub = Arc::new(ObserverRegistry::new(devices.clone()));
        let dispatcher = Dispatcher::new(hub.clone(), cap);
        (devices, hub, dispatcher)
    }

    fn state_with_lat(imei: &str, lat: f64) -> DeviceState {
        let mut state = DeviceState::new(imei);
        state.lat = Some(lat);
        state
    }

    fn observe(hub: &ObserverRegistry) -> mpsc::UnboundedReceiver<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(Arc::new(ObserverState::new(tx))).expect("register");
        // Consume the initial snapshot so the receiver sees updates only.
        let snapshot = rx.try_recv().expect("snapshot");
        let value: Value = match snapshot {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        };
        assert_eq!(value["type"], "initial_state");
        rx
    }

    async fn recv_update(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("open");
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_burst_preserves_fifo_order() {
        let (_devices, hub, dispatcher) = setup(1024);
        let mut rx = observe(&hub);

        // Enqueue a burst before the drainer gets a chance to run; a single
        // drainer must pick up all three in order.
        for lat in [1.0, 2.0, 3.0] {
            dispatcher.enqueue(state_with_lat(IMEI_A, lat));
        }
        assert_eq!(dispatcher.active_drainers(), 1, "one drainer for the burst");

        for expected in [1.0, 2.0, 3.0] {
            let update = recv_update(&mut rx).await;
            assert_eq!(update["type"], "update");
            assert_eq!(update["data"]["lat"], expected);
        }

        assert!(dispatcher.drain_all(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_sequences_monotonic_per_imei() {
        let (_devices, hub, dispatcher) = setup(1024);
        let mut rx = observe(&hub);

        // Interleave two devices; each keeps its own 1..=100 sequence.
        for i in 1..=100u64 {
            assert_eq!(dispatcher.enqueue(state_with_lat(IMEI_A, i as f64)), i);
            assert_eq!(dispatcher.enqueue(state_with_lat(IMEI_B, i as f64)), i);
        }

        let mut lats_a = Vec::new();
        let mut lats_b = Vec::new();
        for _ in 0..200 {
            let update = recv_update(&mut rx).await;
            let lat = update["data"]["lat"].as_f64().unwrap();
            match update["data"]["imei"].as_str().unwrap() {
                IMEI_A => lats_a.push(lat),
                IMEI_B => lats_b.push(lat),
                other => panic!("unexpected imei {other}"),
            }
        }

        let expected: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(lats_a, expected, "per-device order holds");
        assert_eq!(lats_b, expected, "per-device order holds");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let (_devices, hub, dispatcher) = setup(3);
        let mut rx = observe(&hub);

        for lat in [1.0, 2.0, 3.0, 4.0, 5.0] {
            dispatcher.enqueue(state_with_lat(IMEI_A, lat));
        }

        for expected in [3.0, 4.0, 5.0] {
            let update = recv_update(&mut rx).await;
            assert_eq!(update["data"]["lat"], expected);
        }

        assert!(dispatcher.drain_all(Duration::from_secs(1)).await);
        assert_eq!(dispatcher.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_drainer_released_when_idle() {
        let (_devices, hub, dispatcher) = setup(1024);
        let mut rx = observe(&hub);

        dispatcher.enqueue(state_with_lat(IMEI_A, 1.0));
        recv_update(&mut rx).await;
        assert!(dispatcher.drain_all(Duration::from_secs(1)).await);
        assert_eq!(dispatcher.active_drainers(), 0);

        // A fresh enqueue after idle spawns a fresh drainer and keeps the
        // sequence counter going.
        let seq = dispatcher.enqueue(state_with_lat(IMEI_A, 2.0));
        assert_eq!(seq, 2);
        let update = recv_update(&mut rx).await;
        assert_eq!(update["data"]["lat"], 2.0);
    }

    #[tokio::test]
    async fn test_broadcast_failure_does_not_stall_queue() {
        let (_devices, hub, dispatcher) = setup(1024);

        // An observer that goes away right after registering: every
        // subsequent send fails.
        let (tx, rx_dead) = mpsc::unbounded_channel();
        hub.register(Arc::new(ObserverState::new(tx))).expect("register");
        drop(rx_dead);

        let mut rx_live = observe(&hub);

        for lat in [1.0, 2.0] {
            dispatcher.enqueue(state_with_lat(IMEI_A, lat));
        }

        for expected in [1.0, 2.0] {
            let update = recv_update(&mut rx_live).await;
            assert_eq!(update["data"]["lat"], expected);
        }
        assert!(dispatcher.drain_all(Duration::from_secs(1)).await);
    }
}
