//! Envelope formatter: wraps the payload in a prefix and postfix
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, FormatVerdict, Formatter, Message};

#[derive(Deserialize, Serialize, Default)]
struct EnvelopeConfig {
    label: Option<String>,
    prefix: Option<String>,
    postfix: Option<String>,
}

/// Rewrites the payload to `prefix + payload + postfix`.
#[derive(Default)]
pub struct Envelope {
    prefix: Vec<u8>,
    postfix: Vec<u8>,
}

impl Formatter for Envelope {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        if !self.prefix.is_empty() {
            let mut wrapped = Vec::with_capacity(
                self.prefix.len() + message.bytes.len() + self.postfix.len(),
            );
            wrapped.extend_from_slice(&self.prefix);
            wrapped.append(&mut message.bytes);
            message.bytes = wrapped;
        }
        message.bytes.extend_from_slice(&self.postfix);
        Ok(FormatVerdict::Continue)
    }
}

#[weir_plugin_factory]
fn create_envelope(conf: Value) -> Result<ExecutionType, Error> {
    let c: EnvelopeConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Formatter(Box::new(Envelope {
        prefix: c.prefix.unwrap_or_default().into_bytes(),
        postfix: c.postfix.unwrap_or_default().into_bytes(),
    })))
}

pub(super) fn register_envelope() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  prefix:
    type: string
  postfix:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "envelope".into(),
        ItemType::Formatter,
        conf_spec,
        create_envelope,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_envelope().unwrap()
    }

    #[test]
    fn wraps_payload() {
        let envelope = Envelope {
            prefix: b"<".to_vec(),
            postfix: b">".to_vec(),
        };
        let mut m = Message {
            bytes: b"payload".to_vec(),
            ..Default::default()
        };
        assert_eq!(envelope.format(&mut m).unwrap(), FormatVerdict::Continue);
        assert_eq!(m.bytes, b"<payload>");
    }

    #[test]
    fn empty_envelope_is_identity() {
        let envelope = Envelope::default();
        let mut m = Message {
            bytes: b"payload".to_vec(),
            ..Default::default()
        };
        envelope.format(&mut m).unwrap();
        assert_eq!(m.bytes, b"payload");
    }
}
