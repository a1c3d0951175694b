//! JSON metadata formatter: lifts payload fields into message metadata
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, FormatVerdict, Formatter, Message};

#[derive(Deserialize, Serialize)]
struct JsonMetadataConfig {
    label: Option<String>,
    /// metadata path → JSON pointer into the payload
    fields: HashMap<String, String>,
    /// drop messages whose payload is not valid JSON
    #[serde(default)]
    strict: bool,
}

/// Parses the payload as JSON and copies the configured pointers into
/// metadata paths. Pointers that resolve to nothing are skipped; invalid
/// JSON payloads pass through untouched unless `strict` is set.
pub struct JsonMetadata {
    fields: HashMap<String, String>,
    strict: bool,
}

impl Formatter for JsonMetadata {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        let parsed: serde_json::Value = match serde_json::from_slice(&message.bytes) {
            Ok(v) => v,
            Err(e) => {
                if self.strict {
                    return Err(Error::ModulatorError(format!("{e}")));
                }
                return Ok(FormatVerdict::Continue);
            }
        };
        for (meta_path, pointer) in &self.fields {
            if let Some(found) = parsed.pointer(pointer) {
                let yaml: Value = serde_json::from_value::<serde_yaml::Value>(found.clone())
                    .map_err(|e| Error::ModulatorError(format!("{e}")))?;
                message.metadata.set(meta_path, yaml)?;
            }
        }
        Ok(FormatVerdict::Continue)
    }
}

#[weir_plugin_factory]
fn create_json_metadata(conf: Value) -> Result<ExecutionType, Error> {
    let c: JsonMetadataConfig = serde_yaml::from_value(conf.clone())?;
    for pointer in c.fields.values() {
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(Error::ConfigFailedValidation(format!(
                "JSON pointer must start with '/': {pointer}"
            )));
        }
    }
    Ok(ExecutionType::Formatter(Box::new(JsonMetadata {
        fields: c.fields,
        strict: c.strict,
    })))
}

pub(super) fn register_json_metadata() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  fields:
    type: object
  strict:
    type: boolean
required:
  - fields";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "json_metadata".into(),
        ItemType::Formatter,
        conf_spec,
        create_json_metadata,
    )
}
