//! Console producer: one line per message on stdout or stderr
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Error, Message, Producer};

#[derive(Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
enum Target {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Deserialize, Serialize, Default)]
struct ConsoleConfig {
    label: Option<String>,
    target: Option<Target>,
}

/// Writes each payload as a lossy utf-8 line.
#[derive(Default)]
pub struct Console {
    target: Target,
}

#[async_trait]
impl Producer for Console {
    async fn write(&mut self, message: Message) -> Result<(), Error> {
        let line = String::from_utf8_lossy(&message.bytes).into_owned();
        match self.target {
            Target::Stdout => println!("{}", line),
            Target::Stderr => eprintln!("{}", line),
        }
        Ok(())
    }
}

impl Closer for Console {}

#[weir_plugin_factory]
fn create_console(conf: Value) -> Result<ExecutionType, Error> {
    let c: ConsoleConfig = serde_yaml::from_value(conf.clone())?;
    Ok(ExecutionType::Producer(Box::new(Console {
        target: c.target.unwrap_or_default(),
    })))
}

pub(super) fn register_console() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  target:
    type: string
    enum: [stdout, stderr]";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "console".into(),
        ItemType::Producer,
        conf_spec,
        create_console,
    )
}
