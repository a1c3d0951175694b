//! Built-in plugins shipped with the runtime
use crate::Error;

pub mod consumers;
pub mod modulators;
pub mod producers;
pub mod routers;

pub(crate) fn register_plugins() -> Result<(), Error> {
    consumers::register_plugins()?;
    producers::register_plugins()?;
    routers::register_plugins()?;
    modulators::register_plugins()?;
    Ok(())
}
