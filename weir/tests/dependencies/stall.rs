use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use weir_macros::weir_plugin_factory;

use weir::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use weir::{Closer, Error, Message, Producer};

struct Gate {
    released: AtomicBool,
    written: AtomicU64,
}

static GATES: Lazy<Mutex<HashMap<String, Arc<Gate>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn gate(key: &str) -> Arc<Gate> {
    let mut gates = GATES.lock().expect("gate registry");
    Arc::clone(gates.entry(key.to_string()).or_insert_with(|| {
        Arc::new(Gate {
            released: AtomicBool::new(false),
            written: AtomicU64::new(0),
        })
    }))
}

/// Unblocks every pending and future write of the keyed stall producer.
pub fn release(key: &str) {
    gate(key).released.store(true, Ordering::Release);
}

/// Number of writes the keyed stall producer completed.
pub fn written(key: &str) -> u64 {
    gate(key).written.load(Ordering::Acquire)
}

#[derive(Deserialize, Serialize)]
struct StallConfig {
    key: String,
}

/// Producer whose writes block until the test releases them, simulating a
/// saturated egress without ever losing a message.
pub struct Stall {
    gate: Arc<Gate>,
}

#[async_trait]
impl Producer for Stall {
    async fn write(&mut self, _message: Message) -> Result<(), Error> {
        while !self.gate.released.load(Ordering::Acquire) {
            sleep(Duration::from_millis(5)).await;
        }
        let _ = self.gate.written.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Closer for Stall {}

#[weir_plugin_factory]
fn create_stall(conf: Value) -> Result<ExecutionType, Error> {
    let c: StallConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Producer(Box::new(Stall { gate: gate(&c.key) })))
}

pub fn register_stall() -> Result<(), Error> {
    let config = "type: object
properties:
  key:
    type: string
required:
  - key";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin("stall".into(), ItemType::Producer, conf_spec, create_stall)
}
