//! File consumer: replays a file into a stream
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Consumer, Error, Message};

#[derive(Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "snake_case")]
enum Codec {
    /// one message per line
    #[default]
    Lines,
    /// the whole file as a single message
    ToEnd,
}

#[derive(Deserialize, Serialize)]
struct FileConsumerConfig {
    label: Option<String>,
    path: String,
    codec: Option<Codec>,
}

enum Reader {
    Unopened(String),
    Lines(BufReader<File>),
    ToEnd(File),
    Exhausted,
}

/// Reads a file with the configured codec and ends the input at EOF.
pub struct FileConsumer {
    codec: Codec,
    reader: Reader,
}

impl FileConsumer {
    async fn open(&mut self) -> Result<(), Error> {
        let path = match &self.reader {
            Reader::Unopened(path) => path.clone(),
            _ => return Ok(()),
        };
        let file = File::open(&path)
            .await
            .map_err(|e| Error::InputError(format!("open {path}: {e}")))?;
        debug!(path = path, "file consumer opened");
        self.reader = match self.codec {
            Codec::Lines => Reader::Lines(BufReader::new(file)),
            Codec::ToEnd => Reader::ToEnd(file),
        };
        Ok(())
    }
}

#[async_trait]
impl Consumer for FileConsumer {
    async fn read(&mut self) -> Result<Message, Error> {
        self.open().await?;
        match &mut self.reader {
            Reader::Unopened(_) => Err(Error::NoInputToReturn),
            Reader::Lines(reader) => {
                let mut line = String::new();
                let read = reader
                    .read_line(&mut line)
                    .await
                    .map_err(|e| Error::InputError(format!("{e}")))?;
                if read == 0 {
                    self.reader = Reader::Exhausted;
                    return Err(Error::EndOfInput);
                }
                if line.ends_with('\n') {
                    let _ = line.pop();
                    if line.ends_with('\r') {
                        let _ = line.pop();
                    }
                }
                Ok(Message {
                    bytes: line.into_bytes(),
                    ..Default::default()
                })
            }
            Reader::ToEnd(file) => {
                let mut bytes = Vec::new();
                let _ = file
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|e| Error::InputError(format!("{e}")))?;
                self.reader = Reader::Exhausted;
                Ok(Message {
                    bytes,
                    ..Default::default()
                })
            }
            Reader::Exhausted => Err(Error::EndOfInput),
        }
    }
}

impl Closer for FileConsumer {}

#[weir_plugin_factory]
fn create_file(conf: Value) -> Result<ExecutionType, Error> {
    let c: FileConsumerConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Consumer(Box::new(FileConsumer {
        codec: c.codec.unwrap_or_default(),
        reader: Reader::Unopened(c.path),
    })))
}

pub(super) fn register_file() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  path:
    type: string
  codec:
    type: string
    enum: [lines, to_end]
required:
  - path";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin("file".into(), ItemType::Consumer, conf_spec, create_file)
}
