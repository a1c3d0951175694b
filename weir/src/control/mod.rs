//! Process-wide control plane
//!
//! Every consumer and producer owns a private control channel; the
//! [ControlHub] fans signals out to a whole tier. Shutdown follows a
//! fixed sequence: consumers receive PrepareStop and drain, producers
//! receive Stop and drain, then a hard deadline cancels whatever is
//! left.
use flume::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

pub mod health;
pub use health::HealthRegistry;

/// Control signals broadcast to pipeline components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    /// begin accepting work
    Start,
    /// stop accepting new work, keep draining
    PrepareStop,
    /// drain in-flight work and terminate
    Stop,
    /// rotation hint for file-like producers
    Roll,
    /// upstream health failure; short-circuit to fallback
    FuseBurn,
    /// upstream health restored
    FuseActive,
}

/// Latching health state attached to each producer.
///
/// While burned, routers short-circuit the producer to its fallback
/// stream instead of enqueueing.
#[derive(Default)]
pub struct Fuse {
    burned: AtomicBool,
}

impl Fuse {
    /// Creates a healthy fuse.
    pub fn new() -> Arc<Fuse> {
        Arc::new(Fuse::default())
    }

    /// Latches the unhealthy state.
    pub fn burn(&self) {
        self.burned.store(true, Ordering::Release);
    }

    /// Clears the unhealthy state.
    pub fn activate(&self) {
        self.burned.store(false, Ordering::Release);
    }

    /// True while the fuse is burned.
    pub fn is_burned(&self) -> bool {
        self.burned.load(Ordering::Acquire)
    }
}

/// Capacity of per-component control channels. Signals are rare; a small
/// buffer keeps broadcast non-blocking in practice.
const CONTROL_CHANNEL_CAPACITY: usize = 8;

#[derive(Default)]
struct Channels {
    consumers: Vec<Sender<ControlSignal>>,
    producers: Vec<Sender<ControlSignal>>,
}

/// Fan-out hub for control signals.
#[derive(Clone, Default)]
pub struct ControlHub {
    channels: Arc<Mutex<Channels>>,
}

impl ControlHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        ControlHub::default()
    }

    /// Allocates a control channel for a consumer and returns its receive
    /// end.
    pub fn register_consumer(&self) -> Receiver<ControlSignal> {
        let (tx, rx) = bounded(CONTROL_CHANNEL_CAPACITY);
        if let Ok(mut channels) = self.channels.lock() {
            channels.consumers.push(tx);
        }
        rx
    }

    /// Allocates a control channel for a producer and returns its receive
    /// end.
    pub fn register_producer(&self) -> Receiver<ControlSignal> {
        let (tx, rx) = bounded(CONTROL_CHANNEL_CAPACITY);
        if let Ok(mut channels) = self.channels.lock() {
            channels.producers.push(tx);
        }
        rx
    }

    /// Sends a signal to every consumer.
    pub async fn broadcast_consumers(&self, signal: ControlSignal) {
        let targets = self
            .channels
            .lock()
            .map(|c| c.consumers.clone())
            .unwrap_or_default();
        broadcast(targets, signal).await;
    }

    /// Sends a signal to every producer.
    pub async fn broadcast_producers(&self, signal: ControlSignal) {
        let targets = self
            .channels
            .lock()
            .map(|c| c.producers.clone())
            .unwrap_or_default();
        broadcast(targets, signal).await;
    }

    /// Sends a signal to every component.
    pub async fn broadcast_all(&self, signal: ControlSignal) {
        self.broadcast_consumers(signal).await;
        self.broadcast_producers(signal).await;
    }
}

async fn broadcast(targets: Vec<Sender<ControlSignal>>, signal: ControlSignal) {
    trace!(signal = format!("{signal:?}"), targets = targets.len(), "broadcasting");
    let sends = targets.iter().map(|tx| tx.send_async(signal));
    for result in futures::future::join_all(sends).await {
        if result.is_err() {
            // component already exited; nothing left to signal
            debug!("control signal receiver dropped");
        }
    }
}
