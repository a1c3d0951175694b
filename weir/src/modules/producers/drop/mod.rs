//! Drop producer: accepts and discards everything
use async_trait::async_trait;
use serde_yaml::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Error, Message, Producer};

/// Swallows messages, counting them for the shutdown log. Useful as a
/// fallback target and for benchmarking the routing layer.
#[derive(Default)]
pub struct Discard {
    accepted: AtomicU64,
}

#[async_trait]
impl Producer for Discard {
    async fn write(&mut self, _message: Message) -> Result<(), Error> {
        let _ = self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Closer for Discard {
    async fn close(&mut self) -> Result<(), Error> {
        debug!(
            accepted = self.accepted.load(Ordering::Relaxed),
            "drop producer closed"
        );
        Ok(())
    }
}

#[weir_plugin_factory]
fn create_drop(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Producer(Box::new(Discard::default())))
}

pub(super) fn register_drop() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin("drop".into(), ItemType::Producer, conf_spec, create_drop)
}
