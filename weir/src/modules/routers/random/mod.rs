//! Random router: one producer chosen uniformly per message
use async_trait::async_trait;
use rand::Rng;
use serde_yaml::Value;
use tracing::trace;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::producer::ProducerHandle;
use crate::router::{Dispatcher, RoutePolicy};
use crate::{Error, Message};

/// Picks one producer uniformly at random for every message.
pub struct Random;

#[async_trait]
impl RoutePolicy for Random {
    async fn route(
        &self,
        message: Message,
        producers: &[ProducerHandle],
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        if producers.is_empty() {
            return Err(Error::NoConsumers);
        }
        let index = rand::thread_rng().gen_range(0..producers.len());
        if let Err(e) = producers[index].enqueue(message, net, hops).await {
            trace!(
                producer = producers[index].label(),
                error = format!("{e}"),
                "random enqueue degraded"
            );
        }
        Ok(())
    }
}

#[weir_plugin_factory]
fn create_random(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Router(Box::new(Random)))
}

pub(super) fn register_random() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin("random".into(), ItemType::Router, conf_spec, create_random)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_random().unwrap()
    }
}
