//! Stream routing
//!
//! The [Dispatcher] is the arena holding every router; routers and
//! producers reference each other through handles, never owning
//! pointers, so configuration cycles are harmless. Dispatch resolves the
//! message's stream id to a router, applies the router's modulator chain,
//! then hands the message to the router's policy. A rewritten stream id
//! re-enters dispatch; lookups that miss resolve to the wildcard fallback
//! router so misrouted messages always have a defined destination.
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::modulator::{ChainOutcome, ModulatorChain};
use crate::producer::ProducerHandle;
use crate::stream::{StreamId, StreamNames};
use crate::telemetry::{names, Telemetry};
use crate::{Error, Message};

/// Upper bound on stream rewrites for one message. The first hop between
/// streams is legal and common; anything deeper is a configuration cycle.
pub const MAX_ROUTE_HOPS: usize = 4;

/// Dispatch policy deciding which producers receive a message.
#[async_trait]
pub trait RoutePolicy: Send + Sync {
    /// routes one message to zero or more of the attached producers
    async fn route(
        &self,
        message: Message,
        producers: &[ProducerHandle],
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error>;
}

/// One configured router: a stream binding, a modulator chain, a policy
/// and the producers attached to the stream.
pub(crate) struct RouterUnit {
    pub stream: StreamId,
    pub label: String,
    pub chain: ModulatorChain,
    pub policy: Box<dyn RoutePolicy + Send + Sync>,
    pub producers: Vec<ProducerHandle>,
    pub fallback: Option<StreamId>,
}

/// Arena of routers plus the stream lookup table. Built once during
/// configuration, read concurrently afterwards.
pub struct Dispatcher {
    routers: Vec<RouterUnit>,
    by_stream: FxHashMap<StreamId, usize>,
    fallback_index: usize,
    names: Arc<StreamNames>,
    telemetry: Telemetry,
}

impl Dispatcher {
    pub(crate) fn new(
        routers: Vec<RouterUnit>,
        fallback_index: usize,
        names: Arc<StreamNames>,
        telemetry: Telemetry,
    ) -> Self {
        let mut by_stream = FxHashMap::default();
        for (index, router) in routers.iter().enumerate() {
            let _ = by_stream.insert(router.stream, index);
        }
        Dispatcher {
            routers,
            by_stream,
            fallback_index,
            names,
            telemetry,
        }
    }

    /// The intern table shared by the whole pipeline.
    pub fn names(&self) -> &StreamNames {
        &self.names
    }

    /// The telemetry registry shared by the whole pipeline.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// True when a router is bound to this exact stream.
    pub fn knows_stream(&self, stream: StreamId) -> bool {
        self.by_stream.contains_key(&stream)
    }

    /// Routes a message from a consumer. Entry point of the data path.
    pub async fn dispatch(&self, message: Message) -> Result<(), Error> {
        self.deliver(message, 0).await
    }

    /// Routes a message that may already have crossed streams. `hops`
    /// bounds rewrite chains so configuration cycles terminate.
    pub fn deliver(&self, message: Message, hops: usize) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            if hops > MAX_ROUTE_HOPS {
                self.telemetry.incr(names::DISCARDED);
                warn!(
                    stream = format!("{}", message.stream),
                    "routing cycle detected, message discarded"
                );
                return Ok(());
            }

            let index = self
                .by_stream
                .get(&message.stream)
                .copied()
                .unwrap_or(self.fallback_index);
            let router = &self.routers[index];

            let mut message = message;
            let entry_stream = message.stream;
            match router.chain.apply(&mut message) {
                ChainOutcome::Accept => {}
                ChainOutcome::Drop => {
                    self.telemetry.incr(names::FILTERED);
                    return Ok(());
                }
                ChainOutcome::Malformed => {
                    self.telemetry.incr(names::MALFORMED);
                    return Ok(());
                }
                ChainOutcome::Fallback => {
                    return match router.fallback {
                        Some(stream) => {
                            self.telemetry.incr(names::FALLBACK);
                            message.rewrite_stream(stream);
                            self.deliver(message, hops + 1).await
                        }
                        None => {
                            self.telemetry.incr(names::DISCARDED);
                            debug!(router = router.label, "fallback without target, discarded");
                            Ok(())
                        }
                    };
                }
            }

            // a formatter rewrote the stream id; re-resolve the router
            if message.stream != entry_stream {
                trace!(
                    router = router.label,
                    from = format!("{entry_stream}"),
                    to = format!("{}", message.stream),
                    "stream rewritten, re-dispatching"
                );
                return self.deliver(message, hops + 1).await;
            }

            self.telemetry.incr(names::ROUTED);
            router.policy.route(message, &router.producers, self, hops).await
        }
        .boxed()
    }
}

/// Clone-and-enqueue fan-out shared by the broadcast-flavored policies.
/// The first N−1 producers receive deep clones, the last receives the
/// original, in declaration order. One producer timing out does not
/// abort its siblings.
pub(crate) async fn fan_out(
    message: Message,
    producers: &[ProducerHandle],
    net: &Dispatcher,
    hops: usize,
) -> Result<(), Error> {
    let (last, rest) = match producers.split_last() {
        Some(split) => split,
        None => return Err(Error::NoConsumers),
    };
    for producer in rest {
        if let Err(e) = producer.enqueue(message.clone(), net, hops).await {
            trace!(
                producer = producer.label(),
                error = format!("{e}"),
                "fan-out enqueue degraded"
            );
        }
    }
    if let Err(e) = last.enqueue(message, net, hops).await {
        trace!(
            producer = last.label(),
            error = format!("{e}"),
            "fan-out enqueue degraded"
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::control::Fuse;
    use crate::modules::routers::broadcast::Broadcast;
    use crate::modules::routers::round_robin::RoundRobin;
    use crate::producer::{ProducerHandle, StateCell};
    use crate::telemetry::names;
    use crate::{FilterVerdict, FormatVerdict};
    use tokio::time::Duration;

    fn handle(
        label: &str,
        tx: flume::Sender<Message>,
        telemetry: &Telemetry,
    ) -> ProducerHandle {
        ProducerHandle::new(
            Arc::from(label),
            tx,
            Duration::from_millis(50),
            None,
            Fuse::new(),
            StateCell::new(),
            telemetry.clone(),
        )
    }

    fn unit(
        stream: StreamId,
        chain: ModulatorChain,
        producers: Vec<ProducerHandle>,
    ) -> RouterUnit {
        RouterUnit {
            stream,
            label: "unit".to_string(),
            chain,
            policy: Box::new(Broadcast),
            producers,
            fallback: None,
        }
    }

    fn msg(stream: StreamId, text: &str) -> Message {
        let mut m = Message {
            bytes: text.as_bytes().to_vec(),
            ..Default::default()
        };
        m.stream = stream;
        m
    }

    #[tokio::test]
    async fn broadcast_delivers_clones_and_original() {
        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let stream = names_table.intern("s");
        let (tx_a, rx_a) = flume::bounded(8);
        let (tx_b, rx_b) = flume::bounded(8);
        let router = unit(
            stream,
            ModulatorChain::empty(),
            vec![handle("a", tx_a, &telemetry), handle("b", tx_b, &telemetry)],
        );
        let net = Dispatcher::new(vec![router], 0, names_table, telemetry.clone());

        net.dispatch(msg(stream, "payload")).await.unwrap();

        assert_eq!(rx_a.try_recv().unwrap().bytes, b"payload");
        assert_eq!(rx_b.try_recv().unwrap().bytes, b"payload");
        assert_eq!(telemetry.value(names::ENQUEUED), 2);
        assert_eq!(telemetry.value(names::ROUTED), 1);
    }

    #[tokio::test]
    async fn unknown_stream_lands_on_the_fallback_router() {
        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let (tx, rx) = flume::bounded(8);
        let wildcard = unit(
            StreamId::wildcard(),
            ModulatorChain::empty(),
            vec![handle("catchall", tx, &telemetry)],
        );
        let net = Dispatcher::new(vec![wildcard], 0, names_table, telemetry.clone());

        let unknown = StreamId::from_name("nobody-routes-this");
        net.dispatch(msg(unknown, "lost?")).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().bytes, b"lost?");
    }

    #[tokio::test]
    async fn router_chain_drop_is_counted() {
        struct DropAll;
        impl crate::Filter for DropAll {
            fn check(&self, _m: &Message) -> Result<FilterVerdict, Error> {
                Ok(FilterVerdict::Drop)
            }
        }

        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let stream = names_table.intern("s");
        let (tx, rx) = flume::bounded(8);
        let chain = ModulatorChain::new(vec![crate::modulator::Modulator::Filter(Box::new(
            DropAll,
        ))]);
        let router = unit(stream, chain, vec![handle("a", tx, &telemetry)]);
        let net = Dispatcher::new(vec![router], 0, names_table, telemetry.clone());

        net.dispatch(msg(stream, "payload")).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(telemetry.value(names::FILTERED), 1);
    }

    #[tokio::test]
    async fn chain_rewrite_re_resolves_the_router() {
        struct RerouteTo(StreamId);
        impl crate::Formatter for RerouteTo {
            fn format(&self, m: &mut Message) -> Result<FormatVerdict, Error> {
                m.rewrite_stream(self.0);
                Ok(FormatVerdict::Continue)
            }
        }

        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let first = names_table.intern("first");
        let second = names_table.intern("second");
        let (tx_first, rx_first) = flume::bounded(8);
        let (tx_second, rx_second) = flume::bounded(8);

        let chain = ModulatorChain::new(vec![crate::modulator::Modulator::Formatter(Box::new(
            RerouteTo(second),
        ))]);
        let routers = vec![
            unit(first, chain, vec![handle("first", tx_first, &telemetry)]),
            unit(
                second,
                ModulatorChain::empty(),
                vec![handle("second", tx_second, &telemetry)],
            ),
        ];
        let net = Dispatcher::new(routers, 0, names_table, telemetry.clone());

        net.dispatch(msg(first, "moved")).await.unwrap();
        assert!(rx_first.try_recv().is_err());
        assert_eq!(rx_second.try_recv().unwrap().bytes, b"moved");
    }

    #[tokio::test]
    async fn rewrite_cycles_are_bounded_and_discarded() {
        struct Bounce(StreamId);
        impl crate::Formatter for Bounce {
            fn format(&self, m: &mut Message) -> Result<FormatVerdict, Error> {
                m.rewrite_stream(self.0);
                Ok(FormatVerdict::Continue)
            }
        }

        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let ping = names_table.intern("ping");
        let pong = names_table.intern("pong");
        let (tx_a, rx_a) = flume::bounded(8);
        let (tx_b, rx_b) = flume::bounded(8);

        let routers = vec![
            unit(
                ping,
                ModulatorChain::new(vec![crate::modulator::Modulator::Formatter(Box::new(
                    Bounce(pong),
                ))]),
                vec![handle("a", tx_a, &telemetry)],
            ),
            unit(
                pong,
                ModulatorChain::new(vec![crate::modulator::Modulator::Formatter(Box::new(
                    Bounce(ping),
                ))]),
                vec![handle("b", tx_b, &telemetry)],
            ),
        ];
        let net = Dispatcher::new(routers, 0, names_table, telemetry.clone());

        net.dispatch(msg(ping, "bounced")).await.unwrap();
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(telemetry.value(names::DISCARDED), 1);
    }

    #[tokio::test]
    async fn round_robin_takes_turns() {
        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let stream = names_table.intern("rr");
        let (tx_a, rx_a) = flume::bounded(8);
        let (tx_b, rx_b) = flume::bounded(8);
        let router = RouterUnit {
            stream,
            label: "rr".to_string(),
            chain: ModulatorChain::empty(),
            policy: Box::new(RoundRobin::default()),
            producers: vec![handle("a", tx_a, &telemetry), handle("b", tx_b, &telemetry)],
            fallback: None,
        };
        let net = Dispatcher::new(vec![router], 0, names_table, telemetry.clone());

        for n in 0..4 {
            net.dispatch(msg(stream, &format!("m{n}"))).await.unwrap();
        }
        assert_eq!(rx_a.len() + rx_b.len(), 4);
        assert_eq!(rx_a.len(), 2);
        assert_eq!(rx_b.len(), 2);
    }

    #[tokio::test]
    async fn empty_broadcast_is_an_error() {
        let telemetry = Telemetry::new();
        let names_table = Arc::new(StreamNames::new());
        let stream = names_table.intern("empty");
        let router = unit(stream, ModulatorChain::empty(), Vec::new());
        let net = Dispatcher::new(vec![router], 0, names_table, telemetry);

        let result = net.dispatch(msg(stream, "nobody")).await;
        assert!(matches!(result, Err(Error::NoConsumers)));
    }
}
