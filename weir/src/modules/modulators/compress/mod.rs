//! Compression formatters: gzip/zlib payload rewriting
use std::io::Read;

use flate2::{read, Compression};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, FormatVerdict, Formatter, Message};

#[derive(Deserialize, Serialize)]
struct CompressConfig {
    label: Option<String>,
    algorithm: Option<Algorithm>,
}

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// gzip framing
    #[default]
    Gzip,
    /// bare zlib framing
    Zlib,
}

#[derive(Clone, Default)]
enum Operation {
    #[default]
    Compress,
    Decompress,
}

/// Replaces the payload with its compressed or decompressed form.
#[derive(Clone, Default)]
pub struct Compress {
    algorithm: Algorithm,
    method: Operation,
}

impl Formatter for Compress {
    fn format(&self, message: &mut Message) -> Result<FormatVerdict, Error> {
        let mut output = Vec::new();
        let result = match (&self.method, &self.algorithm) {
            (Operation::Compress, Algorithm::Gzip) => {
                read::GzEncoder::new(&message.bytes[..], Compression::default())
                    .read_to_end(&mut output)
            }
            (Operation::Compress, Algorithm::Zlib) => {
                read::ZlibEncoder::new(&message.bytes[..], Compression::default())
                    .read_to_end(&mut output)
            }
            (Operation::Decompress, Algorithm::Gzip) => {
                read::GzDecoder::new(&message.bytes[..]).read_to_end(&mut output)
            }
            (Operation::Decompress, Algorithm::Zlib) => {
                read::ZlibDecoder::new(&message.bytes[..]).read_to_end(&mut output)
            }
        };
        let _ = result.map_err(|e| Error::ModulatorError(format!("{e}")))?;
        message.bytes = output;
        Ok(FormatVerdict::Continue)
    }
}

#[weir_plugin_factory]
fn create_compress(conf: Value) -> Result<ExecutionType, Error> {
    let c: CompressConfig = serde_yaml::from_value(conf)?;
    Ok(ExecutionType::Formatter(Box::new(Compress {
        algorithm: c.algorithm.unwrap_or_default(),
        method: Operation::Compress,
    })))
}

#[weir_plugin_factory]
fn create_decompress(conf: Value) -> Result<ExecutionType, Error> {
    let c: CompressConfig = serde_yaml::from_value(conf)?;
    Ok(ExecutionType::Formatter(Box::new(Compress {
        algorithm: c.algorithm.unwrap_or_default(),
        method: Operation::Decompress,
    })))
}

pub(super) fn register_compress() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  algorithm:
    type: string
    enum: [gzip, zlib]";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "compress".into(),
        ItemType::Formatter,
        conf_spec.clone(),
        create_compress,
    )?;
    register_plugin(
        "decompress".into(),
        ItemType::Formatter,
        conf_spec,
        create_decompress,
    )
}
