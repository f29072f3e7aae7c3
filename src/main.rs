use clap::Parser;
use raft_kv::{KvClient, KvClientError, RaftKvConfig, RaftOptions};
use slog::Drain;
use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::time::Duration;

const JOIN_ATTEMPTS: u32 = 10;

/// Runs one member of a replicated key-value cluster.
#[derive(Parser, Debug)]
#[command(name = "kv-node")]
struct Args {
    /// Unique, stable ID of this node.
    #[arg(long)]
    node: String,

    /// Directory for the log, term/vote state and snapshots.
    #[arg(long)]
    data_dir: PathBuf,

    /// Address to serve the client API on.
    #[arg(long, alias = "http", default_value = "127.0.0.1:11000")]
    client_addr: String,

    /// Address to serve raft RPCs on. Peers reach this node here.
    #[arg(long, default_value = "127.0.0.1:12000")]
    raft: String,

    /// Start a new cluster with this node as its only voter.
    #[arg(long)]
    bootstrap: bool,

    /// Client address of a node in an existing cluster (its leader) to join.
    #[arg(long, conflicts_with = "bootstrap")]
    join: Option<String>,

    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    log_level: slog::Level,
}

fn parse_log_level(s: &str) -> Result<slog::Level, String> {
    slog::Level::from_str(s).map_err(|_| format!("Unknown log level '{}'", s))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let logger = create_root_logger_for_stdout(args.log_level);

    let node = raft_kv::try_create_node(RaftKvConfig {
        replica_id: args.node.clone(),
        raft_address: args.raft.clone(),
        client_address: Some(args.client_addr.clone()),
        data_dir: args.data_dir,
        bootstrap: args.bootstrap,
        logger: logger.clone(),
        options: RaftOptions::default(),
    })
    .await?;

    if let Some(join_address) = &args.join {
        join_cluster(&logger, join_address, &args.node, &args.raft).await?;
    }

    slog::info!(logger, "Node {} is up. Ctrl-C to stop.", args.node);
    tokio::signal::ctrl_c().await?;
    node.shutdown().await;

    Ok(())
}

async fn join_cluster(
    logger: &slog::Logger,
    join_address: &str,
    node_id: &str,
    raft_address: &str,
) -> Result<(), KvClientError> {
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 1;
    loop {
        let result = match KvClient::connect(join_address).await {
            Ok(mut client) => client.join(node_id, raft_address).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                slog::info!(logger, "Joined cluster via {}", join_address);
                return Ok(());
            }
            Err(e) if attempt < JOIN_ATTEMPTS => {
                slog::warn!(logger, "Join attempt {} via {} failed: {}", attempt, join_address, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn create_root_logger_for_stdout(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
