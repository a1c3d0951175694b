//! Timestamp formatter: stamps wall-clock time into payload or metadata
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, FormatVerdict, Formatter, Message};

/// Pattern used when none is configured.
const DEFAULT_PATTERN: &str = "%Y-%m-%d %H:%M:%S ";

#[derive(Deserialize, Serialize, Default)]
struct TimestampConfig {
    label: Option<String>,
    /// chrono format string
    pattern: Option<String>,
    /// write into this metadata path instead of prefixing the payload
    key: Option<String>,
}

/// Prepends a formatted timestamp to the payload, or writes it to a
/// metadata path when `key` is configured.
pub struct Timestamp {
    pattern: String,
    key: Option<String>,
}

impl Formatter for Timestamp {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        let stamp = Local::now().format(&self.pattern).to_string();
        match &self.key {
            Some(path) => {
                message.metadata.set(path, stamp)?;
            }
            None => {
                let mut stamped = stamp.into_bytes();
                stamped.append(&mut message.bytes);
                message.bytes = stamped;
            }
        }
        Ok(FormatVerdict::Continue)
    }
}

#[weir_plugin_factory]
fn create_timestamp(conf: Value) -> Result<ExecutionType, Error> {
    let c: TimestampConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Formatter(Box::new(Timestamp {
        pattern: c.pattern.unwrap_or_else(|| DEFAULT_PATTERN.to_string()),
        key: c.key,
    })))
}

pub(super) fn register_timestamp() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  pattern:
    type: string
  key:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "timestamp".into(),
        ItemType::Formatter,
        conf_spec,
        create_timestamp,
    )
}
