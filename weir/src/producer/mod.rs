//! Producer framework
//!
//! Producers own a bounded message channel and an egress resource. The
//! framework runs the control loop: it dequeues messages in enqueue
//! order, applies the producer's modulator chain, writes with bounded
//! retries, and falls back instead of dropping when the egress misbehaves.
//! Routers talk to producers exclusively through [ProducerHandle].
use flume::{Receiver, TrySendError};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::control::{ControlSignal, Fuse};
use crate::modulator::{ChainOutcome, ModulatorChain};
use crate::router::Dispatcher;
use crate::stream::StreamId;
use crate::sync::{SpinPriority, Spinner};
use crate::telemetry::{names, Telemetry};
use crate::{Error, Message, Producer};

/// Write retries for transient egress errors before falling back.
const WRITE_RETRIES: u32 = 3;

/// Base backoff between write retries; doubles per attempt.
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle state of a consumer or producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PluginState {
    /// constructed, not yet started
    Initializing = 0,
    /// accepting work
    Active = 1,
    /// no longer accepting new work, still draining
    PrepareStop = 2,
    /// draining finished, closing resources
    Stopping = 3,
    /// terminated
    Dead = 4,
}

/// Shared atomic cell holding a [PluginState].
#[derive(Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Creates a cell in [PluginState::Initializing].
    pub fn new() -> Arc<StateCell> {
        Arc::new(StateCell::default())
    }

    /// Reads the current state.
    pub fn get(&self) -> PluginState {
        match self.0.load(Ordering::Acquire) {
            0 => PluginState::Initializing,
            1 => PluginState::Active,
            2 => PluginState::PrepareStop,
            3 => PluginState::Stopping,
            _ => PluginState::Dead,
        }
    }

    /// Stores a new state.
    pub fn set(&self, state: PluginState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// True while the producer accepts new messages.
    pub fn accepting(&self) -> bool {
        matches!(self.get(), PluginState::Initializing | PluginState::Active)
    }
}

/// Rate gate for repetitive error logs: one log per second, with the
/// number of suppressed occurrences reported on the next allowed log.
#[derive(Default)]
pub(crate) struct RateGate {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RateGate {
    pub(crate) fn allow(&self) -> Option<u64> {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *last {
            Some(at) if at.elapsed() < Duration::from_secs(1) => {
                let _ = self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(Instant::now());
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

/// Cheap, cloneable reference to a running producer, held by routers.
#[derive(Clone)]
pub struct ProducerHandle {
    label: Arc<str>,
    sender: flume::Sender<Message>,
    timeout: Duration,
    fallback: Option<StreamId>,
    fuse: Arc<Fuse>,
    state: Arc<StateCell>,
    telemetry: Telemetry,
}

impl ProducerHandle {
    pub(crate) fn new(
        label: Arc<str>,
        sender: flume::Sender<Message>,
        timeout: Duration,
        fallback: Option<StreamId>,
        fuse: Arc<Fuse>,
        state: Arc<StateCell>,
        telemetry: Telemetry,
    ) -> Self {
        ProducerHandle {
            label,
            sender,
            timeout,
            fallback,
            fuse,
            state,
            telemetry,
        }
    }

    /// Label of the producer behind this handle.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        self.state.get()
    }

    /// True while the producer's fuse is burned.
    pub fn fuse_burned(&self) -> bool {
        self.fuse.is_burned()
    }

    /// Enqueues a message into the producer's bounded channel.
    ///
    /// A burned fuse or a stopping producer diverts immediately. A full
    /// channel is retried with adaptive backoff until the configured
    /// timeout, then the message is diverted to the fallback stream. The
    /// message is delivered, delivered to fallback, or counted as
    /// discarded; it is never lost silently.
    pub async fn enqueue(
        &self,
        message: Message,
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        if self.fuse.is_burned() || !self.state.accepting() {
            return self.divert(message, net, hops).await;
        }

        let mut message = match self.sender.try_send(message) {
            Ok(()) => {
                self.telemetry.incr(names::ENQUEUED);
                return Ok(());
            }
            Err(TrySendError::Disconnected(m)) => {
                return self.divert(m, net, hops).await;
            }
            Err(TrySendError::Full(m)) => m,
        };

        let deadline = Instant::now() + self.timeout;
        let mut spinner = Spinner::new(SpinPriority::Medium);
        loop {
            if Instant::now() >= deadline {
                trace!(producer = self.label(), "enqueue timed out, diverting");
                self.divert(message, net, hops).await?;
                return Err(Error::Saturated);
            }
            spinner.wait().await;
            message = match self.sender.try_send(message) {
                Ok(()) => {
                    self.telemetry.incr(names::ENQUEUED);
                    return Ok(());
                }
                Err(TrySendError::Disconnected(m)) => {
                    return self.divert(m, net, hops).await;
                }
                Err(TrySendError::Full(m)) => m,
            };
        }
    }

    /// Redirects a message to the fallback stream, or counts it as
    /// discarded when no fallback is configured.
    pub async fn divert(
        &self,
        mut message: Message,
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        match self.fallback {
            Some(stream) => {
                self.telemetry.incr(names::FALLBACK);
                message.rewrite_stream(stream);
                net.deliver(message, hops + 1).await
            }
            None => {
                self.telemetry.incr(names::DISCARDED);
                debug!(producer = self.label(), "message discarded, no fallback");
                Ok(())
            }
        }
    }
}

/// Everything the framework loop needs besides the plugin itself.
pub(crate) struct ProducerContext {
    pub label: Arc<str>,
    pub state: Arc<StateCell>,
    pub fuse: Arc<Fuse>,
    pub chain: Arc<ModulatorChain>,
    pub fallback: Option<StreamId>,
    pub net: Arc<Dispatcher>,
    pub telemetry: Telemetry,
    pub write_errors: Arc<RateGate>,
}

impl ProducerContext {
    async fn divert(&self, mut message: Message, reason: &str) {
        match self.fallback {
            Some(stream) => {
                self.telemetry.incr(names::FALLBACK);
                message.rewrite_stream(stream);
                if let Err(e) = self.net.deliver(message, 1).await {
                    warn!(
                        producer = self.label.as_ref(),
                        error = format!("{e}"),
                        "fallback delivery failed"
                    );
                }
            }
            None => {
                self.telemetry.incr(names::DISCARDED);
                if let Some(suppressed) = self.write_errors.allow() {
                    warn!(
                        producer = self.label.as_ref(),
                        reason = reason,
                        suppressed,
                        "message discarded, no fallback"
                    );
                }
            }
        }
    }
}

/// Message control loop. Dequeues in enqueue order, applies the modulator
/// chain, writes with bounded retries and falls back on failure. The
/// ticker arm fires only for plugins that request an interval.
pub(crate) async fn run_producer(
    mut plugin: Box<dyn Producer + Send + Sync>,
    messages: Receiver<Message>,
    control: Receiver<ControlSignal>,
    ctx: ProducerContext,
) -> Result<(), Error> {
    debug!(producer = ctx.label.as_ref(), "producer connected");

    let tick_every = plugin.tick_interval();
    let mut ticker = interval(tick_every.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            ctl = control.recv_async() => match ctl {
                Ok(ControlSignal::Start) => {
                    ctx.state.set(PluginState::Active);
                    trace!(producer = ctx.label.as_ref(), "producer active");
                }
                Ok(ControlSignal::PrepareStop) => {
                    ctx.state.set(PluginState::PrepareStop);
                }
                Ok(ControlSignal::Roll) => {
                    if let Err(e) = plugin.roll().await {
                        error!(
                            producer = ctx.label.as_ref(),
                            error = format!("{e}"),
                            "rotation hint failed"
                        );
                    }
                }
                Ok(ControlSignal::FuseBurn) => ctx.fuse.burn(),
                Ok(ControlSignal::FuseActive) => ctx.fuse.activate(),
                Ok(ControlSignal::Stop) | Err(_) => {
                    ctx.state.set(PluginState::Stopping);
                    // drain whatever the routers already enqueued
                    while let Ok(message) = messages.try_recv() {
                        write_one(plugin.as_mut(), message, &ctx).await;
                    }
                    plugin.close().await?;
                    ctx.state.set(PluginState::Dead);
                    debug!(producer = ctx.label.as_ref(), "producer closed");
                    return Ok(());
                }
            },
            message = messages.recv_async() => match message {
                Ok(message) => write_one(plugin.as_mut(), message, &ctx).await,
                Err(_) => {
                    // every sender dropped; drain happened upstream
                    ctx.state.set(PluginState::Stopping);
                    plugin.close().await?;
                    ctx.state.set(PluginState::Dead);
                    debug!(producer = ctx.label.as_ref(), "producer channel closed");
                    return Ok(());
                }
            },
            _ = ticker.tick(), if tick_every.is_some() => {
                if let Err(e) = plugin.tick().await {
                    if let Some(suppressed) = ctx.write_errors.allow() {
                        error!(
                            producer = ctx.label.as_ref(),
                            error = format!("{e}"),
                            suppressed,
                            "producer tick failed"
                        );
                    }
                }
            },
        }
    }
}

async fn write_one(plugin: &mut (dyn Producer + Send + Sync), mut message: Message, ctx: &ProducerContext) {
    match ctx.chain.apply(&mut message) {
        ChainOutcome::Accept => {}
        ChainOutcome::Drop => {
            ctx.telemetry.incr(names::FILTERED);
            return;
        }
        ChainOutcome::Malformed => {
            ctx.telemetry.incr(names::MALFORMED);
            return;
        }
        ChainOutcome::Fallback => {
            ctx.divert(message, "modulator fallback").await;
            return;
        }
    }

    let mut attempt = 0;
    loop {
        match plugin.write(message.clone()).await {
            Ok(()) => {
                if ctx.fuse.is_burned() {
                    // egress recovered; let routers enqueue again
                    ctx.fuse.activate();
                    debug!(producer = ctx.label.as_ref(), "fuse cleared");
                }
                return;
            }
            Err(Error::Saturated) => {
                // egress buffer full twice over; fallback immediately
                ctx.divert(message, "egress saturated").await;
                return;
            }
            Err(Error::OutputError(e)) if attempt + 1 < WRITE_RETRIES => {
                // transient; retry with backoff
                attempt += 1;
                if let Some(suppressed) = ctx.write_errors.allow() {
                    warn!(
                        producer = ctx.label.as_ref(),
                        error = e,
                        attempt,
                        suppressed,
                        "transient write error, retrying"
                    );
                }
                sleep(WRITE_BACKOFF * 2u32.saturating_pow(attempt - 1)).await;
            }
            Err(e) => {
                if let Some(suppressed) = ctx.write_errors.allow() {
                    error!(
                        producer = ctx.label.as_ref(),
                        error = format!("{e}"),
                        suppressed,
                        "write failed"
                    );
                }
                // target unreachable: short-circuit routers to fallback
                // until a queued write succeeds again
                ctx.fuse.burn();
                ctx.divert(message, "write failed").await;
                return;
            }
        }
    }
}
