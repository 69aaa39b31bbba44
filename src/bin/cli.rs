//! Operator CLI

use clap::{Parser, Subcommand};
use leasehold::agent::MemberStatus;
use leasehold::common::MemberSpec;
use leasehold::store;
use leasehold::Config;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(about = "leasehold cluster CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show lease and member health for the cluster
    Status {
        /// Config file
        #[arg(long, default_value = "/etc/leasehold.toml")]
        config: PathBuf,

        /// Emit machine-readable JSON instead of the table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct LeaseSummary {
    holder: String,
    token: u64,
}

#[derive(Serialize)]
struct ClusterStatus {
    cluster: String,
    lease: Option<LeaseSummary>,
    members: Vec<MemberLine>,
}

#[derive(Serialize)]
struct MemberLine {
    id: String,
    reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<MemberStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status { config, json } => {
            let config = Config::load(&config)?;
            config.validate()?;
            status(&config, json).await?;
        }
    }

    Ok(())
}

async fn status(config: &Config, json: bool) -> anyhow::Result<()> {
    let cluster = &config.cluster;

    let store = store::connect(&cluster.store).await?;
    let lease = store::bounded(
        cluster.store_timeout(),
        store.current_lease(&cluster.lease_key()),
    )
    .await;

    // Probe every member once; both output modes render from this
    let client = reqwest::Client::new();
    let mut members = Vec::new();
    for member in &cluster.members {
        let line = match probe(&client, member, cluster.probe_timeout()).await {
            Ok(status) => MemberLine {
                id: member.id.clone(),
                reachable: true,
                status: Some(status),
                error: None,
            },
            Err(e) => MemberLine {
                id: member.id.clone(),
                reachable: false,
                status: None,
                error: Some(e.to_string()),
            },
        };
        members.push(line);
    }

    if json {
        let summary = ClusterStatus {
            cluster: cluster.name.clone(),
            lease: match &lease {
                Ok(Some(lease)) => Some(LeaseSummary {
                    holder: lease.holder.clone(),
                    token: lease.token,
                }),
                _ => None,
            },
            members,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Cluster: {}", cluster.name);
    match &lease {
        Ok(Some(lease)) => println!("Lease:   held by {} (token {})", lease.holder, lease.token),
        Ok(None) => println!("Lease:   none (no primary elected)"),
        Err(e) => println!("Lease:   unavailable ({})", e),
    }
    println!("Members:");
    for line in &members {
        println!("  {}", member_row(line));
    }

    Ok(())
}

fn member_row(line: &MemberLine) -> String {
    match &line.status {
        Some(status) => format!(
            "{:<10} role={:<8} election={:<9} lag={} state={}",
            line.id, status.role, status.election, status.replication_lag, status.state
        ),
        None => format!(
            "{:<10} unreachable ({})",
            line.id,
            line.error.as_deref().unwrap_or("unknown")
        ),
    }
}

async fn probe(
    client: &reqwest::Client,
    member: &MemberSpec,
    timeout: Duration,
) -> anyhow::Result<MemberStatus> {
    let resp = client
        .get(member.status_url())
        .timeout(timeout)
        .send()
        .await?;
    let status = resp.json::<MemberStatus>().await?;
    Ok(status)
}
