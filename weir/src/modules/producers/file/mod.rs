//! File producer: batched writes with rotation, pruning and compression
//!
//! Messages are buffered in a double-buffered batch and written
//! newline-delimited to a rotating file target. Flushes happen when the
//! batch fills, when the flush interval passes, and on the control
//! plane's Roll and Stop signals.
use async_trait::async_trait;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tokio::time::Duration;
use weir_macros::weir_plugin_factory;

use crate::batch::MessageBatch;
use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::sync::BytePool;
use crate::writer::{FileNaming, Pruner, RotatingWriter, RotationPolicy};
use crate::{
    deserialize_optional_duration, deserialize_optional_size, Closer, Error, Message, Producer,
};

/// Batch capacity used when none is configured.
const DEFAULT_BATCH_COUNT: usize = 128;

/// Flush interval used when none is configured.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for in-flight appends when the producer closes.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Deserialize, Serialize, Default)]
struct PruneConfig {
    /// delete rotated files older than this
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    max_age: Option<Duration>,
    /// keep only this many newest files
    keep_count: Option<usize>,
    /// keep the total size of rotated files under this budget
    #[serde(default, deserialize_with = "deserialize_optional_size")]
    total_size: Option<u64>,
}

#[derive(Deserialize, Serialize, Default)]
struct BatchConfig {
    count: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    timeout: Option<Duration>,
}

#[derive(Deserialize, Serialize)]
struct FileConfig {
    label: Option<String>,
    path: String,
    #[serde(default, deserialize_with = "deserialize_optional_size")]
    max_size: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    max_age: Option<Duration>,
    /// local time of day ("HH:MM") forcing a rotation
    rotate_at: Option<String>,
    /// chrono pattern for the timestamp in rotated names
    timestamp_pattern: Option<String>,
    /// zero-pad width of the collision counter
    counter_width: Option<usize>,
    #[serde(default)]
    compress: bool,
    prune: Option<PruneConfig>,
    batch: Option<BatchConfig>,
}

/// Batched, rotating file sink.
pub struct FileProducer {
    batch: MessageBatch,
    writer: RotatingWriter,
    flush_interval: Duration,
    pool: BytePool,
}

impl FileProducer {
    async fn write_out(&mut self, messages: Vec<Message>) -> Result<(), Error> {
        // one write per record so rotation thresholds apply between
        // messages, never inside one
        for message in &messages {
            let mut buf = self.pool.acquire(message.bytes.len() + 1);
            buf.extend_from_slice(&message.bytes);
            buf.push(b'\n');
            self.writer.write(&buf).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Producer for FileProducer {
    async fn write(&mut self, message: Message) -> Result<(), Error> {
        let mut drained: Option<Vec<Message>> = None;
        let appended = self
            .batch
            .append_or_flush(message, |messages| drained = Some(messages))
            .await;
        if let Some(messages) = drained {
            self.write_out(messages).await?;
        }
        match appended {
            Ok(()) => Ok(()),
            // batch full twice over; hand the message to the fallback path
            Err(_rejected) => Err(Error::Saturated),
        }
    }

    async fn tick(&mut self) -> Result<(), Error> {
        if let Some(messages) = self.batch.flush_on_timeout(self.flush_interval).await {
            self.write_out(messages).await?;
        }
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.flush_interval)
    }

    async fn roll(&mut self) -> Result<(), Error> {
        let pending = self.batch.flush().await;
        self.write_out(pending).await?;
        self.writer.rotate().await
    }
}

#[async_trait]
impl Closer for FileProducer {
    async fn close(&mut self) -> Result<(), Error> {
        let remaining = self.batch.close(CLOSE_DRAIN_TIMEOUT).await;
        self.write_out(remaining).await?;
        self.writer.close().await
    }
}

#[weir_plugin_factory]
fn create_file(conf: Value) -> Result<ExecutionType, Error> {
    let c: FileConfig = serde_yaml::from_value(conf.clone())?;

    let daily_at = match &c.rotate_at {
        Some(raw) => Some(
            NaiveTime::parse_from_str(raw, "%H:%M")
                .map_err(|e| Error::ConfigFailedValidation(format!("rotate_at: {e}")))?,
        ),
        None => None,
    };

    let mut naming = FileNaming::new(&c.path);
    if let Some(pattern) = c.timestamp_pattern {
        naming.timestamp_pattern = pattern;
    }
    if let Some(width) = c.counter_width {
        naming.counter_width = width;
    }

    let policy = RotationPolicy {
        max_size: c.max_size,
        max_age: c.max_age,
        daily_at,
    };

    let pruner = c.prune.and_then(|p| {
        let pruner = Pruner {
            max_age: p.max_age,
            keep_count: p.keep_count,
            total_size: p.total_size,
        };
        pruner.is_configured().then_some(pruner)
    });

    let batch_conf = c.batch.unwrap_or_default();
    let s = FileProducer {
        batch: MessageBatch::new(batch_conf.count.unwrap_or(DEFAULT_BATCH_COUNT)),
        writer: RotatingWriter::for_files(naming, policy, c.compress, pruner),
        flush_interval: batch_conf.timeout.unwrap_or(DEFAULT_FLUSH_INTERVAL),
        pool: BytePool::new(),
    };
    Ok(ExecutionType::Producer(Box::new(s)))
}

pub(super) fn register_file() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  path:
    type: string
  max_size:
    type: [string, integer]
  max_age:
    type: string
  rotate_at:
    type: string
  timestamp_pattern:
    type: string
  counter_width:
    type: integer
  compress:
    type: boolean
  prune:
    type: object
    properties:
      max_age:
        type: string
      keep_count:
        type: integer
      total_size:
        type: [string, integer]
  batch:
    type: object
    properties:
      count:
        type: integer
      timeout:
        type: string
required:
  - path";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin("file".into(), ItemType::Producer, conf_spec, create_file)
}
