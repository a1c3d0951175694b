use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use weir_macros::weir_plugin_factory;

use weir::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use weir::{Closer, Consumer, Error, Message};

#[derive(Deserialize, Serialize, Clone)]
struct Event {
    payload: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize, Serialize)]
struct MetaGenConfig {
    events: Vec<Event>,
}

/// Consumer emitting scripted payloads with metadata, for exercising
/// metadata-driven routing.
pub struct MetaGenerator {
    events: Vec<Event>,
    next: usize,
}

#[async_trait]
impl Consumer for MetaGenerator {
    async fn read(&mut self) -> Result<Message, Error> {
        if self.next >= self.events.len() {
            return Err(Error::EndOfInput);
        }
        let event = self.events[self.next].clone();
        self.next += 1;

        let mut message = Message {
            bytes: event.payload.into_bytes(),
            ..Default::default()
        };
        for (key, value) in event.metadata {
            message.metadata.set(&key, value)?;
        }
        Ok(message)
    }
}

impl Closer for MetaGenerator {}

#[weir_plugin_factory]
fn create_metagen(conf: Value) -> Result<ExecutionType, Error> {
    let c: MetaGenConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Consumer(Box::new(MetaGenerator {
        events: c.events,
        next: 0,
    })))
}

pub fn register_metagen() -> Result<(), Error> {
    let config = "type: object
properties:
  events:
    type: array
    items:
      type: object
      properties:
        payload:
          type: string
        metadata:
          type: object
required:
  - events";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "metagen".into(),
        ItemType::Consumer,
        conf_spec,
        create_metagen,
    )
}
