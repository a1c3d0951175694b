//! Ordered modulator chains
//!
//! A modulator is either a [Filter] or a [Formatter]. Chains run in
//! declared order; the first non-continue outcome ends the chain, with
//! one exception: [FilterVerdict::DropAndContinue] latches a drop while
//! the remaining modulators still run. Formatters may rewrite the stream
//! id; the surrounding dispatcher re-resolves the target router when they
//! do.
use tracing::debug;

use crate::{Error, Filter, FilterVerdict, FormatVerdict, Formatter, Message};

/// A filter or formatter slot in a chain.
pub enum Modulator {
    /// inspects the message and votes on its fate
    Filter(Box<dyn Filter>),
    /// rewrites payload, metadata or stream id
    Formatter(Box<dyn Formatter>),
}

/// Final outcome of applying a chain to one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    /// the message continues through the pipeline
    Accept,
    /// the message was rejected by a modulator
    Drop,
    /// the message is redirected to the fallback stream
    Fallback,
    /// the message could not be inspected or rewritten
    Malformed,
}

/// Ordered list of modulators applied to every message passing a router
/// or producer.
#[derive(Default)]
pub struct ModulatorChain {
    modulators: Vec<Modulator>,
}

impl ModulatorChain {
    /// Creates an empty chain that accepts everything.
    pub fn empty() -> Self {
        ModulatorChain::default()
    }

    /// Creates a chain from an ordered modulator list.
    pub fn new(modulators: Vec<Modulator>) -> Self {
        ModulatorChain { modulators }
    }

    /// Number of modulators in the chain.
    pub fn len(&self) -> usize {
        self.modulators.len()
    }

    /// True when the chain has no modulators.
    pub fn is_empty(&self) -> bool {
        self.modulators.is_empty()
    }

    /// Applies the chain in declared order.
    pub fn apply(&self, message: &mut Message) -> ChainOutcome {
        let mut pending_drop = false;
        for modulator in &self.modulators {
            let step = match modulator {
                Modulator::Filter(filter) => match filter.check(message) {
                    Ok(FilterVerdict::Accept) => None,
                    Ok(FilterVerdict::Drop) => Some(ChainOutcome::Drop),
                    Ok(FilterVerdict::DropAndContinue) => {
                        pending_drop = true;
                        None
                    }
                    Err(e) => Some(malformed(message, e)),
                },
                Modulator::Formatter(formatter) => match formatter.format(message) {
                    Ok(FormatVerdict::Continue) => None,
                    Ok(FormatVerdict::Drop) => Some(ChainOutcome::Drop),
                    Ok(FormatVerdict::Fallback) => Some(ChainOutcome::Fallback),
                    Err(e) => Some(malformed(message, e)),
                },
            };
            if let Some(outcome) = step {
                return outcome;
            }
        }
        if pending_drop {
            ChainOutcome::Drop
        } else {
            ChainOutcome::Accept
        }
    }
}

fn malformed(message: &Message, error: Error) -> ChainOutcome {
    debug!(
        sequence = message.sequence,
        error = format!("{error}"),
        "message rejected by modulator"
    );
    ChainOutcome::Malformed
}
