//! Configurable log and event pipeline
//!
//! Weir ingests messages from many sources, optionally transforms and
//! filters them, routes them between internal named streams, and emits
//! them to many sinks. A pipeline is wired up from a declarative yaml
//! configuration listing consumers (ingress), routers (per-stream fan-out
//! policy), producers (egress) and modulators (per-message filters and
//! formatters).
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::Duration;

pub mod batch;
pub mod config;
pub mod control;
pub mod metadata;
pub mod modulator;
pub mod producer;
pub mod router;
pub mod stream;
pub mod sync;
pub mod telemetry;
pub mod writer;

pub use runtime::Runtime;
pub(crate) mod consumer;
pub(crate) mod modules;
mod runtime;

use metadata::Metadata;
use stream::StreamId;

/// Per-process message sequence counter. Monotonically increasing for the
/// lifetime of the process, never reused.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Deserialize an optional duration from a string like "100ms", "10s" or "5m".
pub(crate) fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => parse_duration::parse(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize an optional byte size from a number or a string with a
/// `kb` / `mb` suffix, e.g. `1kb`, `512`, `10mb`.
pub(crate) fn deserialize_optional_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    let opt: Option<Raw> = Option::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => parse_size(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s.as_str(), ""),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size literal: {input}"))?;
    match unit.trim() {
        "" | "b" => Ok(n),
        "kb" => Ok(n * 1024),
        "mb" => Ok(n * 1024 * 1024),
        other => Err(format!("unrecognized size unit: {other}")),
    }
}

/// Message is the unit of data moving through the pipeline: an owned
/// payload, typed metadata, and the id of the stream it currently belongs
/// to.
///
/// ```
/// # use weir::Message;
/// let message = Message {
///     bytes: b"This is a message being processed".to_vec(),
///     ..Default::default()
/// };
/// ```
///
/// Cloning produces an independent payload and metadata copy; two messages
/// that may be written concurrently never share payload bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// raw bytes of the message to be collected, modulated and emitted
    pub bytes: Vec<u8>,
    /// typed metadata, addressable with `a/b/c` and `k[n]` paths
    pub metadata: Metadata,
    /// id of the stream this message is currently routed on
    pub stream: StreamId,
    /// the stream this message was on before its last rewrite
    pub prev_stream: StreamId,
    /// label of the consumer that created this message, for response routing
    pub source: Option<Arc<str>>,
    /// monotonic creation time
    pub created: Instant,
    /// per-process monotonically increasing sequence number
    pub sequence: u64,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            bytes: Vec::new(),
            metadata: Metadata::new(),
            stream: StreamId::invalid(),
            prev_stream: StreamId::invalid(),
            source: None,
            created: Instant::now(),
            sequence: next_sequence(),
        }
    }
}

impl Message {
    /// Move the message to another stream, remembering where it came from.
    pub fn rewrite_stream(&mut self, target: StreamId) {
        self.prev_stream = self.stream;
        self.stream = target;
    }
}

/// Outcome of a [Filter] applied to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    /// message passes, continue with the chain
    Accept,
    /// message is rejected, the chain ends
    Drop,
    /// message is rejected but the remaining modulators still run
    DropAndContinue,
}

/// Outcome of a [Formatter] applied to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatVerdict {
    /// continue with the chain
    Continue,
    /// message is rejected, the chain ends
    Drop,
    /// message is redirected to the fallback stream, the chain ends
    Fallback,
}

/// Closer is implemented by consumers and producers to gracefully release
/// their external resources during shutdown.
#[async_trait]
pub trait Closer {
    /// gracefully terminate resources prior to shutdown of the pipeline
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Consumer modules own an ingress resource and emit [Message]s into their
/// bound streams.
///
/// The framework drives the loop: it calls [Consumer::read], stamps the
/// message with the consumer's configured stream id and a fresh sequence
/// number, and dispatches it. [Error::EndOfInput] ends the consumer,
/// [Error::NoInputToReturn] backs off and retries.
#[async_trait]
pub trait Consumer: Closer {
    /// read a single message from the ingress resource
    async fn read(&mut self) -> Result<Message, Error>;
}

/// Producer modules own an egress resource and write [Message]s to it.
///
/// Producers run a control loop owned by the framework: messages are
/// dequeued from the producer's bounded channel and handed to
/// [Producer::write] in enqueue order. Producers that buffer internally
/// can request a periodic [Producer::tick] by returning an interval from
/// [Producer::tick_interval].
#[async_trait]
pub trait Producer: Closer {
    /// write one message to the egress resource
    async fn write(&mut self, message: Message) -> Result<(), Error>;

    /// periodic callback, enabled by [Producer::tick_interval]
    async fn tick(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// interval between [Producer::tick] calls, `None` disables the ticker
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// rotation hint from the control plane, meaningful for file-like sinks
    async fn roll(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Filter modulators inspect a message and decide whether it continues.
pub trait Filter: Send + Sync {
    /// judge the message
    fn check(&self, message: &Message) -> Result<FilterVerdict, Error>;
}

/// Formatter modulators rewrite payload, metadata or the stream id.
pub trait Formatter: Send + Sync {
    /// transform the message in place
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error>;
}

/// Errors surfaced by the pipeline.
///
/// Uses `thiserror` so variants chain their sources properly. Sentinel
/// variants ([Error::EndOfInput], [Error::NoInputToReturn],
/// [Error::Saturated]) drive control flow rather than signal failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Yaml parsing errors found within the declarative configuration
    #[error("Unable to serialize YAML object")]
    UnableToSerializeYamlObject(
        #[from]
        #[source]
        serde_yaml::Error,
    ),

    /// JSON serialization is used when handing yaml configuration snippets
    /// to the jsonschema validator
    #[error("Unable to serialize JSON object")]
    UnableToSerializeJsonObject(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// Top-level validation errors in the configuration document
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provided jsonschema for a plugin is itself invalid
    #[error("Invalid validation schema: {0}")]
    InvalidValidationSchema(String),

    /// Configuration provided to a plugin failed its schema
    #[error("Configuration validation failed: {0}")]
    ConfigFailedValidation(String),

    /// Plugin type tag is not registered
    #[error("Configuration item not found: {0}")]
    ConfigurationItemNotFound(String),

    /// A plugin of the same category has already been registered
    #[error("Duplicate registered name: {0}")]
    DuplicateRegisteredName(String),

    /// Unable to secure an internal lock
    #[error("Internal error: unable to secure lock")]
    UnableToSecureLock,

    /// Failure of internal machinery rather than a plugin
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Error while reading from a consumer's ingress resource
    #[error("Input error: {0}")]
    InputError(String),

    /// Error while writing to a producer's egress resource
    #[error("Output error: {0}")]
    OutputError(String),

    /// A modulator failed while inspecting or rewriting a message
    #[error("Modulator error: {0}")]
    ModulatorError(String),

    /// A metadata value exists at the path but has an incompatible type
    #[error("Type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        /// metadata path that was queried
        path: String,
        /// type the accessor asked for
        expected: &'static str,
        /// type actually stored
        found: &'static str,
    },

    /// Consumer has finished and will not produce more input; triggers a
    /// graceful shutdown of the consumer
    #[error("End of input reached")]
    EndOfInput,

    /// Consumer has no message right now; the framework backs off and retries
    #[error("No input to return")]
    NoInputToReturn,

    /// A router was asked to dispatch with no producers attached
    #[error("Router has no producers attached")]
    NoConsumers,

    /// Producer channel stayed full beyond the enqueue timeout
    #[error("Producer saturated beyond enqueue timeout")]
    Saturated,

    /// A stream name was referenced that is not known to the registry
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// Failure to send to an internal channel
    #[error("Pipeline processing error: {0}")]
    UnableToSendToChannel(String),

    /// Failure to receive from an internal channel
    #[error("Channel receive error")]
    RecvChannelError(
        #[from]
        #[source]
        flume::RecvError,
    ),

    /// Graceful shutdown did not finish before the hard deadline
    #[error("Shutdown deadline exceeded")]
    ShutdownDeadlineExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_unique_and_increasing() {
        let a = Message::default();
        let b = Message::default();
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn clone_is_deep() {
        let mut a = Message {
            bytes: b"payload".to_vec(),
            ..Default::default()
        };
        let b = a.clone();
        a.bytes[0] = b'X';
        assert_eq!(b.bytes, b"payload");
    }

    #[test]
    fn rewrite_stream_records_previous() {
        let mut m = Message::default();
        let first = StreamId::from_name("first");
        let second = StreamId::from_name("second");
        m.stream = first;
        m.rewrite_stream(second);
        assert_eq!(m.stream, second);
        assert_eq!(m.prev_stream, first);
    }

    #[test]
    fn parse_size_plain_number() {
        assert_eq!(parse_size("512").unwrap(), 512);
    }

    #[test]
    fn parse_size_kilobytes() {
        assert_eq!(parse_size("2kb").unwrap(), 2048);
        assert_eq!(parse_size("2KB").unwrap(), 2048);
    }

    #[test]
    fn parse_size_megabytes() {
        assert_eq!(parse_size("3mb").unwrap(), 3 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_unknown_unit() {
        assert!(parse_size("10gb").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn duration_suffixes_decode() {
        #[derive(serde::Deserialize)]
        struct Probe {
            #[serde(default, deserialize_with = "deserialize_optional_duration")]
            timeout: Option<Duration>,
        }

        let p: Probe = serde_yaml::from_str("timeout: \"100ms\"").unwrap();
        assert_eq!(p.timeout, Some(Duration::from_millis(100)));
        let p: Probe = serde_yaml::from_str("timeout: \"2min\"").unwrap();
        assert_eq!(p.timeout, Some(Duration::from_secs(120)));
        let p: Probe = serde_yaml::from_str("{}").unwrap();
        assert_eq!(p.timeout, None);
    }
}
