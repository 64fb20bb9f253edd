//! glyph-server: WebSocket entry point for the collaborative sync core.

use std::path::PathBuf;

use clap::Parser;
use glyph_collab::room::RelayConfig;
use glyph_collab::server::{ServerConfig, SyncServer};
use glyph_collab::signaling::SignalingConfig;

/// Real-time document sync and call signaling relay
#[derive(Debug, Parser)]
#[command(name = "glyph-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, short, env = "GLYPH_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for room journals (in-memory when omitted)
    #[arg(long, short, env = "GLYPH_STORAGE")]
    storage: Option<PathBuf>,

    /// Seconds between expected client heartbeats
    #[arg(long, env = "GLYPH_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Maximum members in one room
    #[arg(long, env = "GLYPH_MAX_MEMBERS", default_value_t = 100)]
    max_members: usize,

    /// Per-room broadcast channel capacity
    #[arg(long, env = "GLYPH_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Largest gap served as a diff; larger gaps get a snapshot
    #[arg(long, env = "GLYPH_MAX_DIFF", default_value_t = 1024)]
    max_diff_records: usize,

    /// Queued signaling messages per peer
    #[arg(long, env = "GLYPH_SIGNAL_QUEUE", default_value_t = 64)]
    signal_queue: usize,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            storage_path: self.storage,
            relay: RelayConfig {
                broadcast_capacity: self.broadcast_capacity,
                max_members_per_room: self.max_members,
                max_diff_records: self.max_diff_records,
            },
            signaling: SignalingConfig {
                endpoint_capacity: self.signal_queue,
            },
            heartbeat_interval_secs: self.heartbeat_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    match &config.storage_path {
        Some(path) => log::info!("Persisting journals under {}", path.display()),
        None => log::warn!("No storage configured; journals are lost on exit"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
