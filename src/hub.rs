//! # Live Telemetry Hub Module
//!
//! Single point of fan-out for live data. Exactly one producer at a time (the
//! device manager's link or the mock generator) calls `publish`; every
//! subscribed viewer gets its own bounded queue and the store gets every
//! sample regardless of viewer backpressure.
//!
//! ## Backpressure
//! A full viewer queue drops its oldest event. Live views prefer recency over
//! completeness and the producer never waits on a viewer.
//!
//! ## Locking
//! One mutex guards the viewer set and the snapshots. Hand-off to the store
//! happens after it is released.

use crate::phase::{ConnectionPhase, DeviceState};
use crate::sample::{Sample, SampleClock, Source};
use crate::store::SampleStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

pub type ViewerId = u64;

/// One record of the real-time feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub timestamp: i64,
    pub bpm: u16,
    pub source: Source,
    pub connection_phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
}

impl FeedRecord {
    fn new(sample: &Sample, device: &DeviceState) -> Self {
        Self {
            timestamp: sample.timestamp,
            bpm: sample.bpm,
            source: sample.source,
            connection_phase: device.phase.label(),
            rssi: device.rssi,
        }
    }
}

/// What a viewer receives
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Sample(FeedRecord),
    Status(DeviceState),
}

impl FeedEvent {
    pub fn as_sample(&self) -> Option<&FeedRecord> {
        match self {
            FeedEvent::Sample(record) => Some(record),
            FeedEvent::Status(_) => None,
        }
    }
}

/// Bounded drop-oldest queue feeding one viewer
struct ViewerQueue {
    events: Mutex<VecDeque<FeedEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ViewerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: FeedEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct HubState {
    viewers: HashMap<ViewerId, Arc<ViewerQueue>>,
    next_id: ViewerId,
    latest: Option<Sample>,
    device: DeviceState,
}

struct HubInner {
    state: Mutex<HubState>,
    store: SampleStore,
    clock: SampleClock,
    capacity: usize,
}

/// Shared handle to the hub; clones refer to the same viewer set
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl TelemetryHub {
    pub fn new(store: SampleStore, viewer_queue_capacity: usize) -> Self {
        TelemetryHub {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    viewers: HashMap::new(),
                    next_id: 1,
                    latest: None,
                    device: DeviceState::default(),
                }),
                store,
                clock: SampleClock::new(),
                capacity: viewer_queue_capacity,
            }),
        }
    }

    /// Timestamp for a new sample; never lower than any earlier one
    pub fn next_timestamp(&self) -> i64 {
        self.inner.clock.now()
    }

    /// Fan a sample out to every viewer and hand it to the store
    pub fn publish(&self, sample: Sample) {
        let device_address = {
            let mut state = self.inner.state.lock();
            state.latest = Some(sample);
            let event = FeedEvent::Sample(FeedRecord::new(&sample, &state.device));
            for queue in state.viewers.values() {
                queue.push(event.clone());
            }
            match state.device.phase {
                ConnectionPhase::Connected => state.device.address.clone(),
                _ => None,
            }
        };

        log::debug!("Published {} bpm ({:?})", sample.bpm, sample.source);
        self.inner.store.append(sample, device_address);
    }

    /// Record the device snapshot; with `broadcast` every viewer is told too
    pub fn set_device_state(&self, device: DeviceState, broadcast: bool) {
        let mut state = self.inner.state.lock();
        if broadcast {
            let event = FeedEvent::Status(device.clone());
            for queue in state.viewers.values() {
                queue.push(event.clone());
            }
        }
        state.device = device;
    }

    /// Register a viewer. It first receives the current device state and the
    /// latest sample (if any), then every event published afterwards.
    pub fn subscribe(&self) -> Viewer {
        let queue = Arc::new(ViewerQueue::new(self.inner.capacity));
        let mut state = self.inner.state.lock();

        queue.push(FeedEvent::Status(state.device.clone()));
        if let Some(latest) = state.latest {
            queue.push(FeedEvent::Sample(FeedRecord::new(&latest, &state.device)));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.viewers.insert(id, queue.clone());
        log::info!("Viewer {} subscribed ({} active)", id, state.viewers.len());

        Viewer {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a viewer. Returns whether it was still subscribed; calling it
    /// again is harmless.
    pub fn unsubscribe(&self, id: ViewerId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            state.viewers.remove(&id)
        };
        match removed {
            Some(queue) => {
                queue.close();
                log::info!("Viewer {} unsubscribed", id);
                true
            }
            None => false,
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.state.lock().viewers.len()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.inner.state.lock().latest
    }

    pub fn device_state(&self) -> DeviceState {
        self.inner.state.lock().device.clone()
    }

    pub fn store(&self) -> &SampleStore {
        &self.inner.store
    }
}

/// A subscribed viewer. Dropping it unsubscribes.
pub struct Viewer {
    id: ViewerId,
    queue: Arc<ViewerQueue>,
    hub: Weak<HubInner>,
}

impl Viewer {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Wait for the next event; `None` once unsubscribed and drained
    pub async fn recv(&self) -> Option<FeedEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<FeedEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<FeedEvent> {
        self.queue.events.lock().drain(..).collect()
    }

    /// Events discarded because this viewer fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            TelemetryHub { inner }.unsubscribe(self.id);
        }
    }
}
