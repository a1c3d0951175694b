//! Consumer framework
//!
//! A consumer owns an ingress resource and emits messages into its bound
//! streams. The framework loop selects on the control channel first, then
//! on the plugin's `read()`; messages are stamped with the consumer's
//! label and stream id, run through the consumer's modulator chain, and
//! dispatched. Multi-stream consumers fan out with deep clones, the last
//! stream reusing the original message.
use flume::Receiver;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, trace};

use crate::control::ControlSignal;
use crate::modulator::{ChainOutcome, ModulatorChain};
use crate::producer::{PluginState, StateCell};
use crate::router::Dispatcher;
use crate::stream::StreamId;
use crate::telemetry::{names, Telemetry};
use crate::{Consumer, Error, Message};

/// Minimum backoff when no input is available (in microseconds)
const NO_INPUT_BACKOFF_MIN_US: u64 = 1;

/// Maximum backoff when no input is available (in milliseconds)
const NO_INPUT_BACKOFF_MAX_MS: u64 = 10;

pub(crate) struct ConsumerContext {
    pub label: Arc<str>,
    pub state: Arc<StateCell>,
    pub chain: Arc<ModulatorChain>,
    pub streams: Vec<StreamId>,
    pub net: Arc<Dispatcher>,
    pub telemetry: Telemetry,
}

/// Ingress control loop. Returns cleanly on [Error::EndOfInput] or a stop
/// signal; read errors close the ingress and surface to the runtime.
pub(crate) async fn run_consumer(
    mut plugin: Box<dyn Consumer + Send + Sync>,
    control: Receiver<ControlSignal>,
    ctx: ConsumerContext,
) -> Result<(), Error> {
    debug!(consumer = ctx.label.as_ref(), "consumer connected");

    let mut no_input_count: u32 = 0;

    loop {
        tokio::select! {
            biased;
            ctl = control.recv_async() => match ctl {
                Ok(ControlSignal::Start) => {
                    ctx.state.set(PluginState::Active);
                    trace!(consumer = ctx.label.as_ref(), "consumer active");
                }
                Ok(ControlSignal::PrepareStop) | Ok(ControlSignal::Stop) | Err(_) => {
                    ctx.state.set(PluginState::Stopping);
                    plugin.close().await?;
                    ctx.state.set(PluginState::Dead);
                    debug!(consumer = ctx.label.as_ref(), "consumer closed by control plane");
                    return Ok(());
                }
                Ok(_) => {
                    // Roll and fuse signals are producer concerns
                }
            },
            m = plugin.read() => {
                match m {
                    Ok(message) => {
                        no_input_count = 0;
                        emit(message, &ctx).await?;
                    }
                    Err(e) => match e {
                        Error::EndOfInput => {
                            ctx.state.set(PluginState::Stopping);
                            plugin.close().await?;
                            ctx.state.set(PluginState::Dead);
                            debug!(consumer = ctx.label.as_ref(), "consumer closed");
                            return Ok(());
                        }
                        Error::NoInputToReturn => {
                            // Exponential backoff: 1μs, 2μs, 4μs, ..., up to 10ms
                            let backoff_us = NO_INPUT_BACKOFF_MIN_US
                                .saturating_mul(1u64 << no_input_count.min(20))
                                .min(NO_INPUT_BACKOFF_MAX_MS * 1000);
                            sleep(Duration::from_micros(backoff_us)).await;
                            no_input_count = no_input_count.saturating_add(1);
                            continue;
                        }
                        _ => {
                            plugin.close().await?;
                            ctx.state.set(PluginState::Dead);
                            error!(
                                consumer = ctx.label.as_ref(),
                                error = format!("{}", e),
                                "read error from consumer"
                            );
                            return Err(Error::ExecutionError(format!(
                                "Received error from read: {}",
                                e
                            )));
                        }
                    },
                }
            },
        }
    }
}

async fn emit(mut message: Message, ctx: &ConsumerContext) -> Result<(), Error> {
    message.source = Some(Arc::clone(&ctx.label));

    let (last, rest) = match ctx.streams.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };
    for stream in rest {
        stamp_and_dispatch(message.clone(), *stream, ctx).await;
    }
    stamp_and_dispatch(message, *last, ctx).await;
    Ok(())
}

/// Stamps the consumer's stream id, runs the consumer chain (which may
/// rewrite the stream again), and dispatches.
async fn stamp_and_dispatch(mut message: Message, stream: StreamId, ctx: &ConsumerContext) {
    message.stream = stream;
    message.prev_stream = stream;

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
            // consumers have no fallback of their own; the wildcard router
            // gives the message a defined destination
            message.rewrite_stream(StreamId::wildcard());
        }
    }

    if let Err(e) = ctx.net.dispatch(message).await {
        trace!(
            consumer = ctx.label.as_ref(),
            error = format!("{e}"),
            "dispatch degraded"
        );
    }
}
