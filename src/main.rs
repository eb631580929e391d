use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stationlink::config::{ClientOptions, Config, HostEndpoint, ServerOptions};
use stationlink::domains::paths;
use stationlink::error::{Result, StationLinkError};
use stationlink::{ClientConnection, Envelope, Listener, Request};

#[derive(Parser, Debug)]
#[command(name = "stationlink")]
#[command(about = "Persistent TCP messaging between stations and a relay server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the relay server.
    Serve {
        #[arg(long, env = "STATIONLINK_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
    /// Connect as a client and test the link.
    Connect {
        #[arg(long, env = "STATIONLINK_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, default_value = "station")]
        client_id: String,

        #[arg(long = "host")]
        hosts: Vec<String>,

        #[arg(long, default_value_t = false)]
        stay: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stationlink=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Commands::Serve { config, port } => serve(config, port).await,
        Commands::Connect {
            config,
            client_id,
            hosts,
            stay,
        } => connect(config, client_id, hosts, stay).await,
    }
}

async fn serve(config: Option<PathBuf>, port: u16) -> Result<()> {
    let options = match config {
        Some(path) => {
            let config = Config::from_file(path)?;
            let server = config
                .server
                .as_ref()
                .ok_or_else(|| StationLinkError::Config("missing server section".to_string()))?;
            ServerOptions::try_from(server)?
        }
        None => ServerOptions::new(port),
    };

    let listener = Listener::builder(options).bind().await?;
    listener.start()?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| StationLinkError::Runtime(e.to_string()))?;
    listener.stop().await;
    Ok(())
}

async fn connect(config: Option<PathBuf>, client_id: String, hosts: Vec<String>, stay: bool) -> Result<()> {
    let options = match config {
        Some(path) => {
            let config = Config::from_file(path)?;
            let client = config
                .client
                .as_ref()
                .ok_or_else(|| StationLinkError::Config("missing client section".to_string()))?;
            ClientOptions::try_from(client)?
        }
        None => {
            let hosts = if hosts.is_empty() {
                vec![HostEndpoint::new("127.0.0.1", 5000)]
            } else {
                hosts
                    .iter()
                    .map(|host| HostEndpoint::parse(host))
                    .collect::<Result<Vec<_>>>()?
            };
            ClientOptions::new(client_id, hosts)
        }
    };

    let client = ClientConnection::new(options)?;
    client.connect().await?;

    let probe = Envelope::request(Request::new(paths::TEST_CONNECTION));
    let reply = client
        .send_and_await(probe, Some(Duration::from_secs(30)))
        .await?;
    let success = reply.response.is_some_and(|response| response.success);
    println!("testConnection: {}", if success { "ok" } else { "failed" });

    if stay {
        info!(client_id = %client.client_id(), "staying connected, press ctrl-c to exit");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| StationLinkError::Runtime(e.to_string()))?;
    }
    client.close().await;
    Ok(())
}
