//! Filter and formatter plugins
use crate::Error;

pub mod base64;
pub mod compress;
pub mod envelope;
pub mod json_metadata;
pub mod rate_filter;
pub mod regex_filter;
pub mod stream_route;
pub mod timestamp;

pub(crate) fn register_plugins() -> Result<(), Error> {
    base64::register_base64()?;
    compress::register_compress()?;
    envelope::register_envelope()?;
    json_metadata::register_json_metadata()?;
    rate_filter::register_rate_filter()?;
    regex_filter::register_regex_filter()?;
    stream_route::register_stream_route()?;
    timestamp::register_timestamp()?;
    Ok(())
}
