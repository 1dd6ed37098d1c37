//! Node binary
//!
//! Runs a single cluster node speaking the line protocol on its listen
//! address. Membership is static for the process lifetime.
//!
//! Example for a 3-node cluster:
//!   paxlog run --listen 127.0.0.1:7001 --nodes 127.0.0.1:7001,127.0.0.1:7002,127.0.0.1:7003
//!   paxlog run --listen 127.0.0.1:7002 --nodes 127.0.0.1:7001,127.0.0.1:7002,127.0.0.1:7003
//!   paxlog run --listen 127.0.0.1:7003 --nodes 127.0.0.1:7001,127.0.0.1:7002,127.0.0.1:7003

use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use paxlog::core::config::ClusterConfig;
use paxlog::server::Server;

#[derive(Parser, Debug)]
#[command(name = "paxlog", about = "Distributed log replicated with Paxos", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a cluster node
    Run {
        /// Interface and port to listen on (host:port)
        #[arg(short, long)]
        listen: String,
        /// Comma-separated list of all cluster nodes, this one included
        #[arg(short, long)]
        nodes: String,
    },
}

fn parse_config(listen: &str, nodes: &str) -> Result<ClusterConfig, String> {
    let listen = listen.trim();
    if listen.is_empty() {
        return Err("invalid listen address".into());
    }

    let mut members: Vec<String> = nodes
        .split(',')
        .map(|node| node.trim().to_owned())
        .filter(|node| !node.is_empty())
        .collect();
    if members.is_empty() {
        return Err("invalid nodes list".into());
    }

    // The listen address doubles as this node's identity in the membership
    // list; tolerate a list that omits it.
    let index = match members.iter().position(|node| node == listen) {
        Some(index) => index,
        None => {
            members.push(listen.to_owned());
            members.len() - 1
        }
    };

    Ok(ClusterConfig::new(members, index))
}

async fn run(listen: String, nodes: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_config(&listen, &nodes)?;
    tracing::info!(
        address = %config.listen_address(),
        cluster_size = config.len(),
        quorum = config.quorum(),
        "starting node"
    );

    let listener = TcpListener::bind(config.listen_address()).await?;
    let server = Arc::new(Server::new(config));

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("terminating");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { listen, nodes } => run(listen, nodes).await,
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "node failed");
        process::exit(1);
    }
}
