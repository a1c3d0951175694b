//! Metadata router: the target stream is read from a metadata key
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::trace;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::producer::ProducerHandle;
use crate::router::{fan_out, Dispatcher, RoutePolicy};
use crate::{Error, Message};

/// Metadata key consulted when none is configured.
const DEFAULT_KEY: &str = "Stream";

#[derive(Deserialize, Serialize)]
struct MetadataConfig {
    label: Option<String>,
    key: Option<String>,
}

/// Reads the configured metadata key; when it names a known stream the
/// message is rewritten and re-dispatched there. A missing or unknown
/// value, or a value naming the source stream itself, falls through to a
/// broadcast on the local producers.
pub struct MetadataRouter {
    key: String,
}

#[async_trait]
impl RoutePolicy for MetadataRouter {
    async fn route(
        &self,
        message: Message,
        producers: &[ProducerHandle],
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        let target = match message.metadata.get_str(&self.key) {
            Ok(Some(name)) => name,
            Ok(None) => {
                return fan_out(message, producers, net, hops).await;
            }
            Err(e) => {
                trace!(key = self.key, error = format!("{e}"), "metadata key unusable");
                return fan_out(message, producers, net, hops).await;
            }
        };

        match net.names().get(&target) {
            Some(id) if id != message.stream && net.knows_stream(id) => {
                let mut routed = message;
                routed.rewrite_stream(id);
                net.deliver(routed, hops + 1).await
            }
            _ => {
                // unknown stream, or first-hop self-reference
                trace!(target = target, "metadata target not routable, broadcasting");
                fan_out(message, producers, net, hops).await
            }
        }
    }
}

#[weir_plugin_factory]
fn create_metadata(conf: Value) -> Result<ExecutionType, Error> {
    let c: MetadataConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Router(Box::new(MetadataRouter {
        key: c.key.unwrap_or_else(|| DEFAULT_KEY.to_string()),
    })))
}

pub(super) fn register_metadata() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  key:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "metadata".into(),
        ItemType::Router,
        conf_spec,
        create_metadata,
    )
}
