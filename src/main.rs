use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::error;

use lsoed::config::Config;
use lsoed::engine::Engine;
use lsoed::metrics::Metrics;
use lsoed::northbound::{HttpReporter, LogReporter, Reporter};
use lsoed::session::VendorRegistry;

#[derive(Parser, Debug)]
#[command(
    name = "lsoed",
    version,
    about = "LSOE daemon - link-layer neighbor discovery and link-state exchange",
    long_about = "Link-State over Ethernet daemon\n\n\
        Discovers neighboring routers with periodic HELLO beacons directly\n\
        over Ethernet, exchanges local addressing information over\n\
        acknowledged per-peer sessions, and reports the collected link state\n\
        northbound as RFC 7752-shaped JSON.\n\n\
        Examples:\n  \
          # Run with defaults on every non-loopback interface\n  \
          lsoed\n\n  \
          # Run against a specific configuration\n  \
          lsoed --config /etc/lsoe/config.toml --log-level debug"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&args.log_level),
    )
    .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(config: Config) -> Result<()> {
    let metrics = Metrics::new();
    let reporter: Box<dyn Reporter> = match &config.report_rfc7752_url {
        Some(url) => Box::new(HttpReporter::new(url.clone())?),
        None => Box::new(LogReporter),
    };
    // Vendor extension handlers would be registered here, keyed by
    // enterprise number.
    let vendors = VendorRegistry::new();

    let engine = Engine::new(config, reporter, vendors, metrics)?;
    engine.run().await
}
