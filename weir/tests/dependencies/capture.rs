use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use weir_macros::weir_plugin_factory;

use weir::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use weir::{Closer, Error, Message, Producer};

static CAPTURED: Lazy<Mutex<HashMap<String, Vec<String>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Messages captured under `key`, in write order.
pub fn captured(key: &str) -> Vec<String> {
    CAPTURED
        .lock()
        .ok()
        .and_then(|map| map.get(key).cloned())
        .unwrap_or_default()
}

#[derive(Deserialize, Serialize)]
struct CaptureConfig {
    key: String,
}

/// Producer that records every payload into a process-wide map so tests
/// can assert per-producer delivery.
pub struct Capture {
    key: String,
}

#[async_trait]
impl Producer for Capture {
    async fn write(&mut self, message: Message) -> Result<(), Error> {
        let text = String::from_utf8_lossy(&message.bytes).into_owned();
        if let Ok(mut map) = CAPTURED.lock() {
            map.entry(self.key.clone()).or_default().push(text);
        }
        Ok(())
    }
}

impl Closer for Capture {}

#[weir_plugin_factory]
fn create_capture(conf: Value) -> Result<ExecutionType, Error> {
    let c: CaptureConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Producer(Box::new(Capture { key: c.key })))
}

pub fn register_capture() -> Result<(), Error> {
    let config = "type: object
properties:
  key:
    type: string
required:
  - key";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "capture".into(),
        ItemType::Producer,
        conf_spec,
        create_capture,
    )
}
