//! epp-proxyd: the EPP reverse proxy daemon.
//!
//! Loads the configuration, resolves the requested backend server profile,
//! then runs the relay event loop. Configuration or argument errors are
//! reported on stderr and exit with status 1 before any socket is opened.

use clap::Parser;
use epprelay::config::{CliArgs, Settings};
use epprelay::server::Proxy;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();
    let settings = Settings::load(&cli)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        server = %settings.profile.name,
        backend = %settings.profile.backend_addr(),
        "starting epp-proxyd"
    );

    let mut proxy = Proxy::bind(settings)?;
    proxy.run()?;
    Ok(())
}
