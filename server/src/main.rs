use clap::Parser;
use log::{info, warn};
use std::sync::Arc;

use server::config::{Args, Config};
use server::network::Server;
use server::pg_store::PgStore;
use server::store::{MemStore, Store};

// Main entry point
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    // Parse command line arguments (environment takes precedence over defaults)
    let args = Args::parse();
    let config = Config::from_args(args);

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set; serving default-world only from an in-memory store");
            Arc::new(MemStore::new())
        }
    };

    info!(
        "starting voxel world server in region {} on {}",
        config.region, config.bind_addr
    );

    Server::new(config, store).run().await
}
