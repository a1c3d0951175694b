//! Distribute router: copies messages onto a set of target streams
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::trace;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::producer::ProducerHandle;
use crate::router::{fan_out, Dispatcher, RoutePolicy};
use crate::{Error, Message};

#[derive(Deserialize, Serialize)]
struct DistributeConfig {
    label: Option<String>,
    targets: Vec<String>,
}

/// Rewrites the stream id to each configured target and re-routes. A
/// target equal to the source stream falls through to a broadcast on the
/// local producers; the last target reuses the original message, all
/// others receive deep clones.
pub struct Distribute {
    targets: Vec<String>,
}

#[async_trait]
impl RoutePolicy for Distribute {
    async fn route(
        &self,
        message: Message,
        producers: &[ProducerHandle],
        net: &Dispatcher,
        hops: usize,
    ) -> Result<(), Error> {
        let (last, rest) = match self.targets.split_last() {
            Some(split) => split,
            None => return fan_out(message, producers, net, hops).await,
        };

        for target in rest {
            send_to(target, message.clone(), producers, net, hops).await?;
        }
        send_to(last, message, producers, net, hops).await
    }
}

async fn send_to(
    target: &str,
    message: Message,
    producers: &[ProducerHandle],
    net: &Dispatcher,
    hops: usize,
) -> Result<(), Error> {
    let target_id = net.names().intern(target);
    if target_id == message.stream {
        // self-reference guard: deliver locally instead of looping
        trace!(target = target, "distribute target equals source stream");
        return fan_out(message, producers, net, hops).await;
    }
    let mut routed = message;
    routed.rewrite_stream(target_id);
    net.deliver(routed, hops + 1).await
}

#[weir_plugin_factory]
fn create_distribute(conf: Value) -> Result<ExecutionType, Error> {
    let c: DistributeConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Router(Box::new(Distribute {
        targets: c.targets,
    })))
}

pub(super) fn register_distribute() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  targets:
    type: array
    items:
      type: string
required:
  - targets";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "distribute".into(),
        ItemType::Router,
        conf_spec,
        create_distribute,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_distribute().unwrap()
    }

    #[test]
    fn missing_targets_fails_schema() {
        let schema = "type: object
properties:
  targets:
    type: array
required:
  - targets";
        let spec = ConfigSpec::from_schema(schema).unwrap();
        assert!(spec.validate("label: oops").is_err());
    }
}
