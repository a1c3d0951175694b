//! Configuration parsing and plugin registration primitives
//!
//! A pipeline is described by a yaml document listing consumers, routers
//! and producers. Every entry carries exactly one plugin-type key whose
//! value is validated against the jsonschema the plugin registered.
//! Environment variables are templated into the document with handlebars
//! before parsing.
use handlebars::Handlebars;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, trace};

use core::future::Future;
use std::pin::Pin;

use crate::router::RoutePolicy;
use crate::{deserialize_optional_duration, Consumer, Error, Filter, Formatter, Producer};

mod registration;
mod validate;
pub use registration::register_plugin;
pub(crate) use validate::parse_configuration_item;

/// Default capacity for producer message channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Default timeout for enqueueing into a producer channel.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Default hard deadline for graceful shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Callback provides the pinned async function that will create the plugin
/// being supplied to the weir runtime
pub type Callback = fn(Value) -> Pin<Box<dyn Future<Output = Result<ExecutionType, Error>> + Send>>;

/// Plugin category used for registration and lookup
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ItemType {
    /// [crate::Consumer] trait enum variant
    Consumer,
    /// [crate::Producer] trait enum variant
    Producer,
    /// [crate::router::RoutePolicy] trait enum variant
    Router,
    /// [crate::Filter] trait enum variant
    Filter,
    /// [crate::Formatter] trait enum variant
    Formatter,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ItemType::Consumer => "consumer",
            ItemType::Producer => "producer",
            ItemType::Router => "router",
            ItemType::Filter => "modulator",
            ItemType::Formatter => "modulator",
        };
        write!(f, "{}", msg)
    }
}

/// Enum holding the constructed plugin implementation
pub enum ExecutionType {
    /// [crate::Consumer] trait enum variant
    Consumer(Box<dyn Consumer + Send + Sync>),
    /// [crate::Producer] trait enum variant
    Producer(Box<dyn Producer + Send + Sync>),
    /// [crate::router::RoutePolicy] trait enum variant
    Router(Box<dyn RoutePolicy + Send + Sync>),
    /// [crate::Filter] trait enum variant
    Filter(Box<dyn Filter>),
    /// [crate::Formatter] trait enum variant
    Formatter(Box<dyn Formatter>),
}

static ENV: Lazy<RwLock<HashMap<ItemType, HashMap<String, RegisteredItem>>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    let _ = m.insert(ItemType::Consumer, HashMap::new());
    let _ = m.insert(ItemType::Producer, HashMap::new());
    let _ = m.insert(ItemType::Router, HashMap::new());
    let _ = m.insert(ItemType::Filter, HashMap::new());
    let _ = m.insert(ItemType::Formatter, HashMap::new());
    RwLock::new(m)
});

/// Registered plugin factory with its validation schema
#[derive(Clone)]
pub(crate) struct RegisteredItem {
    pub creator: Callback,
    pub format: ConfigSpec,
}

/// Validated plugin entry ready for construction during assembly
#[derive(Clone)]
pub(crate) struct ParsedRegisteredItem {
    pub creator: Callback,
    pub config: Value,
}

/// Unparsed configuration entry. The single key left in `extra` names the
/// plugin type.
#[derive(Debug, Deserialize, Serialize, Default)]
pub(crate) struct Item {
    pub label: Option<String>,

    /// single source stream, shorthand for `streams: [name]`
    pub stream: Option<String>,

    /// streams this component is bound to
    pub streams: Option<Vec<String>>,

    /// bounded message channel capacity (producers)
    pub channel: Option<usize>,

    /// enqueue timeout (producers)
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,

    /// stream receiving messages when enqueue fails or a modulator says so
    pub fallback: Option<String>,

    /// sharded consumption: number of loop instances sharing the channel
    pub instances: Option<usize>,

    /// ordered modulator chain applied before dispatch or write
    #[serde(default)]
    pub modulators: Vec<HashMap<String, Value>>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Unparsed weir configuration document
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Optional string label for the pipeline
    pub label: Option<String>,
    /// Default producer channel capacity
    pub channel: Option<usize>,
    /// Default producer enqueue timeout
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
    /// Hard deadline for graceful shutdown
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub shutdown_timeout: Option<Duration>,
    /// Address serving the health-check registry, e.g. `127.0.0.1:8080`
    pub health_addr: Option<String>,
    /// Consumer entries following the [crate::Consumer] trait
    #[allow(private_interfaces)]
    pub consumers: Vec<Item>,
    /// Router entries binding a policy to a stream
    #[serde(default)]
    #[allow(private_interfaces)]
    pub routers: Vec<Item>,
    /// Producer entries following the [crate::Producer] trait
    #[allow(private_interfaces)]
    pub producers: Vec<Item>,
}

impl FromStr for Config {
    type Err = Error;
    fn from_str(conf: &str) -> Result<Self, Self::Err> {
        let mut environment_variables: HashMap<String, String> = HashMap::new();
        for (key, value) in env::vars() {
            let _ = environment_variables.insert(key, value);
        }

        let mut handle_bars = Handlebars::new();
        handle_bars.set_strict_mode(true);

        let populated_config = handle_bars
            .render_template(conf, &environment_variables)
            .map_err(|e| Error::ConfigFailedValidation(format!("{}", e)))?;

        let config: Config = serde_yaml::from_str(&populated_config)?;
        Ok(config)
    }
}

/// Validated modulator entry.
#[derive(Clone)]
pub(crate) struct ParsedModulator {
    pub item: ParsedRegisteredItem,
}

/// Validated component entry with its resolved framework settings.
#[derive(Clone)]
pub(crate) struct ParsedComponent {
    pub label: String,
    pub streams: Vec<String>,
    pub channel: usize,
    pub timeout: Duration,
    pub fallback: Option<String>,
    pub instances: usize,
    pub modulators: Vec<ParsedModulator>,
    pub item: ParsedRegisteredItem,
}

/// Parsed and validated weir configuration
#[derive(Clone)]
pub struct ParsedConfig {
    /// Optional string label for the pipeline
    pub label: Option<String>,
    /// Hard deadline for graceful shutdown
    pub shutdown_timeout: Duration,
    /// Address serving the health-check registry
    pub health_addr: Option<String>,
    #[allow(private_interfaces)]
    pub(crate) consumers: Vec<ParsedComponent>,
    #[allow(private_interfaces)]
    pub(crate) routers: Vec<ParsedComponent>,
    #[allow(private_interfaces)]
    pub(crate) producers: Vec<ParsedComponent>,
}

impl Config {
    /// Validates the document against the registered plugins.
    ///
    /// A component whose plugin config fails validation is skipped with an
    /// error log; validation fails outright only when no viable consumer
    /// or no viable producer remains.
    pub async fn validate(self) -> Result<ParsedConfig, Error> {
        let channel_default = self.channel.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let timeout_default = self.timeout.unwrap_or(DEFAULT_ENQUEUE_TIMEOUT);

        let consumers =
            parse_components(&self.consumers, ItemType::Consumer, channel_default, timeout_default)
                .await;
        let routers =
            parse_components(&self.routers, ItemType::Router, channel_default, timeout_default)
                .await;
        let producers =
            parse_components(&self.producers, ItemType::Producer, channel_default, timeout_default)
                .await;

        if consumers.is_empty() {
            error!("no viable consumer configured");
            return Err(Error::Validation("no viable consumer configured".into()));
        }
        if producers.is_empty() {
            error!("no viable producer configured");
            return Err(Error::Validation("no viable producer configured".into()));
        }

        debug!("configuration is valid");
        Ok(ParsedConfig {
            label: self.label,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            health_addr: self.health_addr,
            consumers,
            routers,
            producers,
        })
    }
}

async fn parse_components(
    items: &[Item],
    itype: ItemType,
    channel_default: usize,
    timeout_default: Duration,
) -> Vec<ParsedComponent> {
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match parse_component(item, itype, index, channel_default, timeout_default).await {
            Ok(component) => out.push(component),
            Err(e) => {
                // fatal for this entry only; the rest of the pipeline starts
                error!(
                    kind = format!("{itype}"),
                    index,
                    error = format!("{e}"),
                    "configuration entry skipped"
                );
            }
        }
    }
    out
}

async fn parse_component(
    item: &Item,
    itype: ItemType,
    index: usize,
    channel_default: usize,
    timeout_default: Duration,
) -> Result<ParsedComponent, Error> {
    if item.extra.len() != 1 {
        return Err(Error::Validation(format!(
            "{itype} entry must contain exactly one plugin key"
        )));
    }

    let parsed = parse_configuration_item(itype, &item.extra).await?;

    let mut modulators = Vec::with_capacity(item.modulators.len());
    for m in &item.modulators {
        // filters and formatters share the modulator list; try both tables
        let parsed_mod = match parse_configuration_item(ItemType::Filter, m).await {
            Ok(i) => i,
            Err(Error::ConfigurationItemNotFound(_)) => {
                parse_configuration_item(ItemType::Formatter, m).await?
            }
            Err(e) => return Err(e),
        };
        modulators.push(ParsedModulator { item: parsed_mod });
    }

    let mut streams = match (&item.stream, &item.streams) {
        (Some(_), Some(_)) => {
            return Err(Error::Validation(
                "use either stream or streams, not both".into(),
            ));
        }
        (Some(single), None) => vec![single.clone()],
        (None, Some(many)) => many.clone(),
        (None, None) => Vec::new(),
    };
    if streams.is_empty() {
        if itype == ItemType::Router {
            return Err(Error::Validation("router entry requires a stream".into()));
        }
        streams.push(crate::stream::WILDCARD_STREAM.to_string());
    }

    let plugin_key = item
        .extra
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| format!("{itype}"));
    let label = item
        .label
        .clone()
        .unwrap_or_else(|| format!("{plugin_key}_{index}"));

    trace!(label = label, kind = format!("{itype}"), "entry validated");

    Ok(ParsedComponent {
        label,
        streams,
        channel: item.channel.unwrap_or(channel_default),
        timeout: item.timeout.unwrap_or(timeout_default),
        fallback: item.fallback.clone(),
        instances: item.instances.unwrap_or(1).clamp(1, num_cpus::get()),
        modulators,
        item: parsed,
    })
}

/// Plugin configuration validation snippet
///
/// Uses `Arc` internally to make cloning cheap without re-parsing the schema.
pub struct ConfigSpec {
    raw_schema: String,
    schema: Arc<JSONSchema>,
}

impl fmt::Debug for ConfigSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSpec")
            .field("raw_schema", &self.raw_schema)
            .finish()
    }
}

impl Clone for ConfigSpec {
    fn clone(&self) -> Self {
        ConfigSpec {
            raw_schema: self.raw_schema.clone(),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl ConfigSpec {
    /// Compiles a validation snippet from a jsonschema document written in
    /// yaml. The yaml is converted to json and compiled as Draft 7.
    pub fn from_schema(conf: &str) -> Result<Self, Error> {
        let v: Value = serde_yaml::from_str(conf)?;
        let intermediate = serde_json::to_string(&v)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;

        let schema: JSONSchema = match JSONSchema::options().with_draft(Draft::Draft7).compile(&f) {
            Ok(js) => js,
            Err(e) => return Err(Error::InvalidValidationSchema(format!("{e}"))),
        };

        trace!("json schema is valid");

        Ok(ConfigSpec {
            raw_schema: conf.into(),
            schema: Arc::new(schema),
        })
    }

    /// Validates a yaml configuration snippet against the schema.
    pub fn validate(&self, content: &str) -> Result<(), Error> {
        let v: Value = serde_yaml::from_str(content)?;
        let intermediate = serde_json::to_string(&v)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;
        let result = self.schema.validate(&f);
        if let Err(errors) = result {
            let errs: Vec<String> = errors.into_iter().map(|i| format!("{}", i)).collect();
            error!(
                number_of_failures = errs.len(),
                errors = errs.join(" "),
                "validation failed"
            );
            return Err(Error::ConfigFailedValidation(errs.join(" ")));
        };
        Ok(())
    }
}
