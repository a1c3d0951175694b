//! Configurable log and event pipeline
//!
//! Runs a weir pipeline described by a declarative yaml configuration:
//! consumers feed named streams, routers fan messages out, producers
//! write them to their sinks.
use std::process;

#[tokio::main]
async fn main() {
    process::exit(weir_cmd::run().await)
}
