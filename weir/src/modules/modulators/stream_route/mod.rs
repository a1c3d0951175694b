//! Stream-route formatter: rewrites the message's stream id
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::stream::StreamId;
use crate::{Error, FormatVerdict, Formatter, Message};

#[derive(Deserialize, Serialize)]
struct StreamRouteConfig {
    label: Option<String>,
    /// static target stream
    stream: Option<String>,
    /// metadata path naming the target stream
    key: Option<String>,
}

/// Moves the message onto another stream. The target is either a static
/// name or read from a metadata path; the surrounding dispatcher
/// re-resolves the router after the rewrite. A missing metadata value
/// leaves the message where it is.
pub struct StreamRoute {
    stream: Option<StreamId>,
    key: Option<String>,
}

impl Formatter for StreamRoute {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        let target = match (&self.stream, &self.key) {
            (Some(id), _) => Some(*id),
            (None, Some(path)) => message
                .metadata
                .get_str(path)?
                .map(|name| StreamId::from_name(&name)),
            (None, None) => None,
        };
        if let Some(id) = target {
            if id != message.stream {
                message.rewrite_stream(id);
            }
        }
        Ok(FormatVerdict::Continue)
    }
}

#[weir_plugin_factory]
fn create_stream_route(conf: Value) -> Result<ExecutionType, Error> {
    let c: StreamRouteConfig = serde_yaml::from_value(conf.clone())?;
    if c.stream.is_none() && c.key.is_none() {
        return Err(Error::ConfigFailedValidation(
            "stream_route requires stream or key".into(),
        ));
    }
    Ok(ExecutionType::Formatter(Box::new(StreamRoute {
        stream: c.stream.map(|name| StreamId::from_name(&name)),
        key: c.key,
    })))
}

pub(super) fn register_stream_route() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  stream:
    type: string
  key:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "stream_route".into(),
        ItemType::Formatter,
        conf_spec,
        create_stream_route,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_stream_route().unwrap()
    }

    #[test]
    fn static_target_rewrites() {
        let target = StreamId::from_name("audit");
        let route = StreamRoute {
            stream: Some(target),
            key: None,
        };
        let mut m = Message::default();
        m.stream = StreamId::from_name("app");
        route.format(&mut m).unwrap();
        assert_eq!(m.stream, target);
        assert_eq!(m.prev_stream, StreamId::from_name("app"));
    }

    #[test]
    fn metadata_target_rewrites() {
        let route = StreamRoute {
            stream: None,
            key: Some("Stream".to_string()),
        };
        let mut m = Message::default();
        m.metadata.set("Stream", "errors").unwrap();
        route.format(&mut m).unwrap();
        assert_eq!(m.stream, StreamId::from_name("errors"));
    }

    #[test]
    fn missing_metadata_leaves_stream_alone() {
        let route = StreamRoute {
            stream: None,
            key: Some("Stream".to_string()),
        };
        let mut m = Message::default();
        let before = m.stream;
        route.format(&mut m).unwrap();
        assert_eq!(m.stream, before);
    }
}
