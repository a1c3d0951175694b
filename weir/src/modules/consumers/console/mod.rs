//! Console consumer: one message per stdin line
use async_trait::async_trait;
use serde_yaml::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Consumer, Error, Message};

/// Reads stdin line by line. EOF or the `exit()` sentinel ends the input.
pub struct Console {
    reader: BufReader<Stdin>,
}

#[async_trait]
impl Consumer for Console {
    async fn read(&mut self) -> Result<Message, Error> {
        let mut buffer = String::new();
        let read = self
            .reader
            .read_line(&mut buffer)
            .await
            .map_err(|_| Error::EndOfInput)?;
        if read == 0 {
            return Err(Error::EndOfInput);
        }

        // remove new line character
        if buffer.ends_with('\n') {
            let _ = buffer.pop();
            if buffer.ends_with('\r') {
                let _ = buffer.pop();
            }
        }

        if buffer == *"exit()" {
            return Err(Error::EndOfInput);
        };

        Ok(Message {
            bytes: buffer.into_bytes(),
            ..Default::default()
        })
    }
}

impl Closer for Console {}

#[weir_plugin_factory]
fn create_console(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Consumer(Box::new(Console {
        reader: BufReader::new(tokio::io::stdin()),
    })))
}

pub(super) fn register_console() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "console".into(),
        ItemType::Consumer,
        conf_spec,
        create_console,
    )
}
