//! bmnetd: a gossip node over the object overlay.

use bmnet::{
    AddrMan, Dispatcher, Inventory, Keypair, MemoryMessageRepository, NetworkConfig,
    NetworkHandler, Secp256k1Crypto, SledInventory,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Interval between inventory eviction and registry persistence passes.
const MAINTENANCE_INTERVAL_SECS: u64 = 300;

#[derive(Parser)]
#[command(name = "bmnetd", version, about = "Object gossip node")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = bmnet::net::DEFAULT_PORT)]
    port: u16,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Seed peers (comma-separated host:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Streams to serve (comma-separated)
    #[arg(long, default_value = "1")]
    streams: String,

    /// Catch up with the seeds once, then exit
    #[arg(long)]
    sync: bool,
}

fn parse_seeds(seeds: &Option<String>) -> Vec<SocketAddr> {
    seeds
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.trim().parse() {
            Ok(addr) => Some(addr),
            Err(err) => {
                warn!("ignoring unparsable seed {s:?}: {err}");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bmnet=info".into()),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)?;

    let streams: Vec<u64> =
        args.streams.split(',').filter_map(|s| s.trim().parse().ok()).collect();
    let config = NetworkConfig {
        port: args.port,
        streams: if streams.is_empty() { vec![1] } else { streams },
        ..NetworkConfig::default()
    };

    let crypto = Arc::new(Secp256k1Crypto::new());
    let inventory = Arc::new(SledInventory::open(args.data_dir.join("inventory"))?);
    let registry_path = args.data_dir.join("knownnodes.dat");
    let registry = Arc::new(match AddrMan::load(&registry_path) {
        Ok(registry) => registry,
        Err(err) => {
            info!("starting with an empty registry: {err}");
            AddrMan::new()
        }
    });
    let repository = Arc::new(MemoryMessageRepository::new());

    let (dispatcher, delivery) = Dispatcher::new(
        crypto.clone(),
        inventory.clone(),
        repository.clone(),
        config.nonce_trials_per_byte,
        config.extra_bytes,
    );
    dispatcher.add_identity(Keypair::generate(&crypto));

    let (handler, events) = NetworkHandler::new(
        config,
        crypto.clone(),
        inventory.clone(),
        registry.clone(),
        dispatcher.clone(),
        None,
    );
    handler.spawn_event_loop(events);

    let seeds = parse_seeds(&args.seeds);

    if args.sync {
        for seed in seeds {
            info!("synchronizing with {seed}");
            if let Err(err) = handler.synchronize(seed, Duration::from_secs(120)).await {
                error!("sync with {seed} failed: {err}");
            }
        }
        let status = handler.status();
        info!("sync complete: {} objects in inventory", status.inventory_count);
        return Ok(());
    }

    let local = handler.listen().await?;
    info!("node up on {local}");
    for seed in seeds {
        if let Err(err) = handler.connect(seed).await {
            warn!("could not reach seed {seed}: {err}");
        }
    }

    spawn_maintenance(
        handler.clone(),
        dispatcher.clone(),
        crypto,
        inventory,
        registry.clone(),
        registry_path.clone(),
    );
    spawn_delivery_log(delivery);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handler.disconnect_all();
    registry.save(&registry_path).ok();
    Ok(())
}

/// Periodic upkeep: inventory eviction, ack re-broadcast, registry save.
fn spawn_maintenance(
    handler: Arc<NetworkHandler>,
    dispatcher: Arc<Dispatcher>,
    crypto: Arc<Secp256k1Crypto>,
    inventory: Arc<SledInventory>,
    registry: Arc<AddrMan>,
    registry_path: PathBuf,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            inventory.cleanup();
            for ack in dispatcher.take_pending_acks() {
                match ack.inventory_vector(crypto.as_ref()) {
                    Ok(iv) => handler.publish(iv, ack),
                    Err(err) => warn!("dropping unpublishable ack: {err}"),
                }
            }
            if let Err(err) = registry.save(&registry_path) {
                warn!("failed to persist registry: {err}");
            }
            let status = handler.status();
            info!(
                "maintenance: {} peers, {} objects",
                status.connections, status.inventory_count
            );
        }
    });
}

fn spawn_delivery_log(mut delivery: mpsc::UnboundedReceiver<bmnet::Plaintext>) {
    tokio::spawn(async move {
        while let Some(plaintext) = delivery.recv().await {
            info!(
                "received {}-byte message (encoding {:?})",
                plaintext.message().len(),
                plaintext.encoding()
            );
        }
    });
}
