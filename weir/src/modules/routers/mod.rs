//! Router policy plugins
use crate::Error;

pub mod broadcast;
pub mod distribute;
pub mod metadata;
pub mod random;
pub mod round_robin;

pub(crate) fn register_plugins() -> Result<(), Error> {
    broadcast::register_broadcast()?;
    distribute::register_distribute()?;
    metadata::register_metadata()?;
    random::register_random()?;
    round_robin::register_round_robin()?;
    Ok(())
}
