//! Producer plugins
use crate::Error;

pub mod console;
pub mod drop;
pub mod file;

pub(crate) fn register_plugins() -> Result<(), Error> {
    console::register_console()?;
    drop::register_drop()?;
    file::register_file()?;
    Ok(())
}
