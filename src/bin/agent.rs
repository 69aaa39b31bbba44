//! Member agent binary

use clap::{Parser, Subcommand};
use leasehold::{Agent, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "leasehold-agent")]
#[command(about = "leasehold member agent: lease election and engine control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent daemon
    Serve {
        /// Config file
        #[arg(long, default_value = "/etc/leasehold.toml")]
        config: PathBuf,

        /// Member id (overrides the config file)
        #[arg(long)]
        id: Option<String>,

        /// Status endpoint bind address (overrides the config file)
        #[arg(long)]
        listen: Option<SocketAddr>,
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
        Commands::Serve { config, id, listen } => {
            let mut config = Config::load(&config)?;
            let Some(agent_config) = config.agent.as_mut() else {
                anyhow::bail!("config file has no [agent] section");
            };
            if let Some(id) = id {
                agent_config.member_id = id;
            }
            if let Some(listen) = listen {
                agent_config.listen_addr = listen;
            }
            // Fatal before any listener opens
            config.validate()?;

            let agent_config = config.agent.take().expect("checked above");
            let agent = Agent::new(config.cluster, agent_config);
            agent.serve().await?;
        }
    }

    Ok(())
}
