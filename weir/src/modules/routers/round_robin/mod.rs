//! Round-robin router: producers take turns in declaration order
use async_trait::async_trait;
use serde_yaml::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::producer::ProducerHandle;
use crate::router::{Dispatcher, RoutePolicy};
use crate::{Error, Message};

/// Dispatches to producer `counter mod N`. The counter advances before
/// every enqueue and wraps around; N is read once per enqueue so a config
/// snapshot with fewer producers stays safe.
#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

#[async_trait]
impl RoutePolicy for RoundRobin {
    async fn route(
        &self,
        message: Message,
        producers: &[ProducerHandle],
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        let n = producers.len();
        if n == 0 {
            return Err(Error::NoConsumers);
        }
        let turn = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let index = turn % n;
        if let Err(e) = producers[index].enqueue(message, net, hops).await {
            trace!(
                producer = producers[index].label(),
                error = format!("{e}"),
                "round-robin enqueue degraded"
            );
        }
        Ok(())
    }
}

#[weir_plugin_factory]
fn create_round_robin(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Router(Box::new(RoundRobin::default())))
}

pub(super) fn register_round_robin() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "round_robin".into(),
        ItemType::Router,
        conf_spec,
        create_round_robin,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_round_robin().unwrap()
    }

    #[test]
    fn counter_wraps_around() {
        let rr = RoundRobin {
            counter: AtomicUsize::new(usize::MAX - 1),
        };
        let before = rr.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        assert_eq!(before % 2, 1);
        let after = rr.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        assert_eq!(after, 0);
    }
}
