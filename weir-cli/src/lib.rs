//! Command-line entry point for running weir pipelines
//!
//! A single executable: `weir -c pipeline.yaml`. Log verbosity is a
//! numeric level (0 off, 1 error, 2 warn, 3 everything), `--ps` prints a
//! startup marker once every plugin reached Active, and
//! `--health-addr` overrides the configured health endpoint address.
use clap::{ArgAction, Parser};
use std::fs;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use weir::{Error, Runtime};

/// Normal shutdown.
pub const EXIT_OK: i32 = 0;
/// The configuration could not be read or parsed.
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// The pipeline could not be assembled or started.
pub const EXIT_STARTUP_FAILURE: i32 = 2;
/// Graceful shutdown missed the hard deadline.
pub const EXIT_FORCED_SHUTDOWN: i32 = 3;

#[derive(Parser)]
#[command(name = "weir")]
#[command(bin_name = "weir")]
#[command(version)]
#[command(disable_version_flag = true)]
struct Cli {
    /// pipeline configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// log level: 0 off, 1 error, 2 warn, 3 info and debug
    #[arg(short = 'l', long = "ll", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    log_level: u8,

    /// print a startup marker on stdout once every plugin is active
    #[arg(short = 'p', long = "ps")]
    startup_marker: bool,

    /// address serving the health-check registry, e.g. 127.0.0.1:8080
    #[arg(long = "health-addr")]
    health_addr: Option<String>,

    /// print version information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

/// Parses arguments, runs the pipeline, and maps the outcome onto the
/// documented exit codes.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    setup_subscriber(cli.log_level);

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            eprintln!("weir: a configuration file is required (-c <config>)");
            return EXIT_CONFIG_ERROR;
        }
    };

    let conf = match fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("weir: cannot read {}: {}", config_path, e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let mut pipeline = match Runtime::from_config(&conf).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("weir: invalid configuration: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    if cli.health_addr.is_some() {
        pipeline.set_health_addr(cli.health_addr);
    }

    if cli.startup_marker {
        let ready = pipeline.on_ready();
        let _ = tokio::spawn(async move {
            if ready.await.is_ok() {
                println!("weir: pipeline active");
            }
        });
    }

    match pipeline.run().await {
        Ok(()) => EXIT_OK,
        Err(Error::ShutdownDeadlineExceeded) => {
            eprintln!("weir: forced shutdown, deadline exceeded");
            EXIT_FORCED_SHUTDOWN
        }
        Err(e) => {
            eprintln!("weir: {}", e);
            EXIT_STARTUP_FAILURE
        }
    }
}

fn setup_subscriber(level: u8) {
    let filter = match level {
        0 => None,
        1 => Some(LevelFilter::ERROR),
        2 => Some(LevelFilter::WARN),
        _ => Some(LevelFilter::DEBUG),
    };
    if let Some(l) = filter {
        let env_filter = EnvFilter::builder()
            .with_default_directive(l.into())
            .from_env_lossy();
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}
