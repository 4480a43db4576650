//! Mainline DHT crawler that collects torrent metadata from announcing peers.

pub mod config;
pub mod crawler;
pub mod fetch;
pub mod krpc;
pub mod metadata;
pub mod node_id;
pub mod scheduler;
pub mod wire;

pub use config::{Config, OutputFormat};
pub use crawler::{Crawler, DhtCrawler};
pub use fetch::{Discovered, MetadataFetcher};
pub use metadata::TorrentMetadata;
pub use scheduler::{TaskError, TaskHandle, TaskScheduler};
pub use wire::{MetadataWire, UtMetadataWire};

use std::sync::Arc;
use tokio::sync::mpsc;

/// Binds the DHT socket and crawls until the socket fails. Every torrent whose
/// metadata is fetched is sent on `events`.
pub async fn run(config: Config, events: mpsc::UnboundedSender<Discovered>) -> anyhow::Result<()> {
    let scheduler = TaskScheduler::new(config.max_connecting_sockets);
    let fetcher = Arc::new(MetadataFetcher::new(&config, UtMetadataWire::new(), events));
    let crawler = DhtCrawler::bind(&config, scheduler, fetcher).await?;
    crawler.run().await
}
