//! Broadcast router: every attached producer receives the message
use async_trait::async_trait;
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::producer::ProducerHandle;
use crate::router::{fan_out, Dispatcher, RoutePolicy};
use crate::{Error, Message};

/// Fans out to all producers in declaration order; the first N−1 receive
/// deep clones, the last the original message.
pub struct Broadcast;

#[async_trait]
impl RoutePolicy for Broadcast {
    async fn route(
        &self,
        message: Message,
        producers: &[ProducerHandle],
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        fan_out(message, producers, net, hops).await
    }
}

#[weir_plugin_factory]
fn create_broadcast(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Router(Box::new(Broadcast)))
}

pub(super) fn register_broadcast() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "broadcast".into(),
        ItemType::Router,
        conf_spec,
        create_broadcast,
    )
}
