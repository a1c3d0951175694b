//! Consumer plugins
use crate::Error;

pub mod console;
pub mod file;
pub mod generator;

pub(crate) fn register_plugins() -> Result<(), Error> {
    console::register_console()?;
    file::register_file()?;
    generator::register_generator()?;
    Ok(())
}
