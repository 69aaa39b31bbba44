//! Proxy binary

use clap::{Parser, Subcommand};
use leasehold::{Config, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "leasehold-proxy")]
#[command(about = "leasehold proxy: health-aware write/read routing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy daemon
    Serve {
        /// Config file
        #[arg(long, default_value = "/etc/leasehold.toml")]
        config: PathBuf,

        /// Write listener address (overrides the config file)
        #[arg(long)]
        write_listen: Option<SocketAddr>,

        /// Read listener address (overrides the config file)
        #[arg(long)]
        read_listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            write_listen,
            read_listen,
        } => {
            let mut config = Config::load(&config)?;
            let Some(proxy_config) = config.proxy.as_mut() else {
                anyhow::bail!("config file has no [proxy] section");
            };
            if let Some(write_listen) = write_listen {
                proxy_config.write_listen = write_listen;
            }
            if let Some(read_listen) = read_listen {
                proxy_config.read_listen = read_listen;
            }
            // Fatal before any listener opens
            config.validate()?;

            let proxy_config = config.proxy.take().expect("checked above");
            let proxy = ProxyServer::new(config.cluster, proxy_config);
            proxy.serve().await?;
        }
    }

    Ok(())
}
