//! vmnet-proxy binary.
//!
//! Loads the configuration (file, then command-line overrides), starts the
//! in-process virtual network and runs the supervisor until a signal or the
//! first fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use vmnet_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use vmnet_proxy::net::Endpoint;
use vmnet_proxy::observability::{init_logging, init_metrics};
use vmnet_proxy::vnet::{MemoryNetwork, Protocol};
use vmnet_proxy::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "vmnet-proxy", version)]
#[command(about = "Bridge a guest VM's network to the host", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host endpoint serving the API (unix:///path, /path or fd://N). Repeatable.
    #[arg(short, long = "listen", value_name = "ENDPOINT")]
    listen: Vec<Endpoint>,

    /// Raw channel carrying the guest's frames (unix://, unixgram:// or fd://N).
    #[arg(long, value_name = "ENDPOINT")]
    guest: Option<Endpoint>,

    /// Verbose logs, profiling routes and the traffic loop.
    #[arg(long)]
    debug: bool,

    /// Maximum ethernet payload size.
    #[arg(long)]
    mtu: Option<usize>,

    /// Framing on the guest channel (hyperkit, qemu, bess, vfkit).
    #[arg(long)]
    protocol: Option<Protocol>,
}

impl Cli {
    /// Command-line values override the file.
    fn apply(self, config: &mut ProxyConfig) {
        if !self.listen.is_empty() {
            config.listener.endpoints = self.listen;
        }
        if self.guest.is_some() {
            config.listener.guest = self.guest;
        }
        if self.debug {
            config.observability.debug = true;
        }
        if let Some(mtu) = self.mtu {
            config.network.mtu = mtu;
        }
        if let Some(protocol) = self.protocol {
            config.network.protocol = protocol;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();

    let config_path = cli.config.take();
    let mut config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("vmnet-proxy: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(errors) = validate_config(&config) {
        eprintln!("vmnet-proxy: {}", ConfigError::Validation(errors));
        return ExitCode::FAILURE;
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vmnet-proxy starting");
    tracing::info!(
        config = ?config_path,
        endpoints = config.listener.endpoints.len(),
        guest = ?config.listener.guest.as_ref().map(ToString::to_string),
        mtu = config.network.mtu,
        protocol = %config.network.protocol,
        "Configuration loaded"
    );

    if let Some(addr) = &config.observability.metrics_address {
        match addr.parse() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(metrics_address = %addr, "Failed to parse metrics address"),
        }
    }

    let network = match MemoryNetwork::new(config.network.clone()) {
        Ok(network) => Arc::new(network),
        Err(e) => {
            tracing::error!(error = %e, "Cannot create virtual network");
            return ExitCode::FAILURE;
        }
    };

    match Supervisor::new(config, network).run().await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Proxy failed");
            ExitCode::FAILURE
        }
    }
}
