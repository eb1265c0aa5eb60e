//! quill-hub: WebSocket fan-out hub for document channels.
//!
//! Configured through `QUILL_HUB_ADDR` and `QUILL_HUB_CAPACITY`; logging
//! through `RUST_LOG`.

use log::info;
use quill_collab::hub::{HubConfig, HubServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = HubConfig::from_env();
    info!(
        "Starting quill-hub on {} (channel capacity {})",
        config.bind_addr, config.channel_capacity
    );
    let server = HubServer::bind(config).await?;
    server.run().await
}
