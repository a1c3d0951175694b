//! Base64 formatters: payload encoding and decoding
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, FormatVerdict, Formatter, Message};

#[derive(Deserialize, Serialize)]
struct Base64Config {
    label: Option<String>,
}

/// Replaces the payload with its base64 encoding.
pub struct Encode;

impl Formatter for Encode {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        message.bytes = STANDARD.encode(&message.bytes).into_bytes();
        Ok(FormatVerdict::Continue)
    }
}

/// Replaces the payload with its base64 decoding.
pub struct Decode;

impl Formatter for Decode {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        message.bytes = STANDARD
            .decode(&message.bytes)
            .map_err(|e| Error::ModulatorError(format!("{e}")))?;
        Ok(FormatVerdict::Continue)
    }
}

#[weir_plugin_factory]
fn create_encode(conf: Value) -> Result<ExecutionType, Error> {
    let _: Base64Config = serde_yaml::from_value(conf)?;
    Ok(ExecutionType::Formatter(Box::new(Encode)))
}

#[weir_plugin_factory]
fn create_decode(conf: Value) -> Result<ExecutionType, Error> {
    let _: Base64Config = serde_yaml::from_value(conf)?;
    Ok(ExecutionType::Formatter(Box::new(Decode)))
}

pub(super) fn register_base64() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "base64_encode".into(),
        ItemType::Formatter,
        conf_spec.clone(),
        create_encode,
    )?;
    register_plugin(
        "base64_decode".into(),
        ItemType::Formatter,
        conf_spec,
        create_decode,
    )
}
