use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use korium_fs::{BlockType, FsConfig, Keypair, MemoryDatastore, MemoryNetwork, StartSearch};

/// Runs a chain of in-process nodes, places a block at the far end and
/// searches for it from the first node.
#[derive(Parser, Debug)]
#[command(name = "korium-fs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the chain.
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Anonymity level of the search (0 also uses the DHT).
    #[arg(short, long, default_value = "1")]
    anonymity: u32,

    /// Size of the block placed at the far end.
    #[arg(short, long, default_value = "4096")]
    block_size: usize,

    /// Disable caching of content passing through.
    #[arg(long)]
    no_caching: bool,

    /// Disable randomized reply delays.
    #[arg(long)]
    no_delays: bool,

    /// Seconds between telemetry snapshots.
    #[arg(short, long, default_value = "10")]
    telemetry_interval: u64,

    /// Exit once the search has been answered.
    #[arg(long)]
    exit_after_search: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        bail!("at least two nodes are needed");
    }

    let config = FsConfig {
        content_caching: !args.no_caching,
        randomized_delays: !args.no_delays,
        ..FsConfig::default()
    };

    let network = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    let mut stores = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let datastore = std::sync::Arc::new(MemoryDatastore::new(1024));
        let node = network.spawn_node(Keypair::generate(), config.clone(), datastore.clone()).await;
        info!(node = %node.identity(), "node started");
        nodes.push(node);
        stores.push(datastore);
    }
    for pair in nodes.windows(2) {
        network.link(&pair[0].identity(), &pair[1].identity()).await?;
    }

    let data: Vec<u8> = (0..args.block_size).map(|_| rand::random::<u8>()).collect();
    let last = stores.last().context("no nodes")?;
    let query = last.insert_block(BlockType::DBlock, data.clone()).await?;
    info!(query = %hex::encode(query), holder = %nodes[args.nodes - 1].identity(), "block placed");

    let searcher = &nodes[0];
    let mut session = searcher.connect_client().await?;
    searcher
        .start_search(session.id, StartSearch {
            block_type: BlockType::DBlock,
            anonymity: args.anonymity,
            options: 0,
            target: None,
            query,
            known_replies: Vec::new(),
        })
        .await?;
    info!(client = %session.id, "search started");

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            result = session.results.recv() => {
                let Some(result) = result else {
                    warn!("result channel closed");
                    break;
                };
                if result.data == data {
                    info!(
                        bytes = result.data.len(),
                        transmissions = result.num_transmissions,
                        respect = result.respect_offered,
                        "block found"
                    );
                } else {
                    warn!("received a result that does not match the block");
                }
                if args.exit_after_search {
                    break;
                }
            }
            _ = interval.tick() => {
                for node in &nodes {
                    match node.telemetry().await {
                        Ok(t) => info!(
                            node = %t.local,
                            peers = t.connected_peers,
                            pending = t.pending_requests,
                            plans = t.plans,
                            typical_priority = format!("{:.2}", t.typical_priority),
                            queries_received = t.counters.queries_received,
                            queries_sent = t.counters.queries_sent,
                            replies_to_peers = t.counters.replies_to_peers,
                            "telemetry snapshot"
                        ),
                        Err(e) => warn!(error = %e, "telemetry unavailable"),
                    }
                }
            }
        }
    }

    network.shutdown().await;
    Ok(())
}
