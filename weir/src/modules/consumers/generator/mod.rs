//! Generator consumer: bounded synthetic source for tests and profiling
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tokio::time::{sleep, Duration};
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{deserialize_optional_duration, Closer, Consumer, Error, Message};

#[derive(Deserialize, Serialize, Default)]
struct GeneratorConfig {
    label: Option<String>,
    /// number of synthetic messages to emit
    count: Option<u64>,
    /// payload prefix, followed by the message index
    payload: Option<String>,
    /// exact messages to emit once, in order; overrides count/payload
    messages: Option<Vec<String>>,
    /// pause between messages
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    interval: Option<Duration>,
}

enum Source {
    Counted { remaining: u64, emitted: u64, payload: String },
    Scripted { messages: Vec<String>, next: usize },
}

/// Emits a fixed message sequence or a counted series, then ends the
/// input.
pub struct Generator {
    source: Source,
    interval: Option<Duration>,
}

#[async_trait]
impl Consumer for Generator {
    async fn read(&mut self) -> Result<Message, Error> {
        if let Some(pause) = self.interval {
            sleep(pause).await;
        }
        let bytes = match &mut self.source {
            Source::Counted {
                remaining,
                emitted,
                payload,
            } => {
                if *remaining == 0 {
                    return Err(Error::EndOfInput);
                }
                *remaining -= 1;
                let text = format!("{payload} {emitted}");
                *emitted += 1;
                text.into_bytes()
            }
            Source::Scripted { messages, next } => {
                if *next >= messages.len() {
                    return Err(Error::EndOfInput);
                }
                let text = messages[*next].clone();
                *next += 1;
                text.into_bytes()
            }
        };

        Ok(Message {
            bytes,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Closer for Generator {}

#[weir_plugin_factory]
fn create_generator(conf: Value) -> Result<ExecutionType, Error> {
    let c: GeneratorConfig = serde_yaml::from_value(conf.clone())?;
    let source = match c.messages {
        Some(messages) => Source::Scripted { messages, next: 0 },
        None => Source::Counted {
            remaining: c.count.unwrap_or(0),
            emitted: 0,
            payload: c.payload.unwrap_or_else(|| "message".to_string()),
        },
    };
    Ok(ExecutionType::Consumer(Box::new(Generator {
        source,
        interval: c.interval,
    })))
}

pub(super) fn register_generator() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  count:
    type: integer
  payload:
    type: string
  messages:
    type: array
    items:
      type: string
  interval:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "generator".into(),
        ItemType::Consumer,
        conf_spec,
        create_generator,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_generator().unwrap()
    }

    #[tokio::test]
    async fn counted_series_then_end() {
        let mut g = Generator {
            source: Source::Counted {
                remaining: 2,
                emitted: 0,
                payload: "tick".to_string(),
            },
            interval: None,
        };
        assert_eq!(g.read().await.unwrap().bytes, b"tick 0");
        assert_eq!(g.read().await.unwrap().bytes, b"tick 1");
        assert!(matches!(g.read().await, Err(Error::EndOfInput)));
    }

    #[tokio::test]
    async fn scripted_messages_in_order() {
        let mut g = Generator {
            source: Source::Scripted {
                messages: vec!["a".to_string(), "b".to_string()],
                next: 0,
            },
            interval: None,
        };
        assert_eq!(g.read().await.unwrap().bytes, b"a");
        assert_eq!(g.read().await.unwrap().bytes, b"b");
        assert!(matches!(g.read().await, Err(Error::EndOfInput)));
    }
}
