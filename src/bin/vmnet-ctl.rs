use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::Value;

use vmnet_proxy::http::client::{ApiClient, ApiResponse, ClientError};
use vmnet_proxy::vnet::forwarder::ForwardProtocol;
use vmnet_proxy::vnet::{ExposeRequest, UnexposeRequest};

#[derive(Parser)]
#[command(name = "vmnet-ctl")]
#[command(about = "Control a running vmnet-proxy through its API socket", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "/var/run/vmnet-proxy/api.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show guest traffic counters
    Stats,
    /// List active port forwards
    Forwards,
    /// Forward a host address to a guest address
    Expose {
        /// Host side, e.g. 127.0.0.1:2222
        local: String,
        /// Guest side, e.g. 192.168.127.2:22
        remote: String,
    },
    /// Remove a port forward
    Unexpose {
        /// Host side of the forward
        local: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.socket);

    let result = match cli.command {
        Commands::Stats => client.get("/network/stats").await,
        Commands::Forwards => client.get("/network/services/forwarder/all").await,
        Commands::Expose { local, remote } => {
            let req = ExposeRequest {
                local,
                remote,
                protocol: ForwardProtocol::Tcp,
            };
            client.post_json("/network/services/forwarder/expose", &req).await
        }
        Commands::Unexpose { local } => {
            let req = UnexposeRequest {
                local,
                protocol: ForwardProtocol::Tcp,
            };
            client.post_json("/network/services/forwarder/unexpose", &req).await
        }
    };

    match result.and_then(print_response) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_response(res: ApiResponse) -> Result<bool, ClientError> {
    if !res.status.is_success() {
        eprintln!("Error: API returned status {}", res.status);
        eprintln!("Response: {}", res.text());
        return Ok(false);
    }

    if res.body.is_empty() {
        println!("ok");
        return Ok(true);
    }

    let json: Value = serde_json::from_slice(&res.body)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(true)
}
