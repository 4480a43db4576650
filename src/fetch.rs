//! Per-infohash metadata fetch: dedup gate, connection ceiling, and the
//! CONNECTING → HANDSHAKING → DONE / FAILED lifecycle of one attempt.

use crate::config::Config;
use crate::metadata::{self, TorrentMetadata};
use crate::wire::MetadataWire;
use anyhow::Context;
use lru::LruCache;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout_at};

/// A torrent whose metadata was fetched and normalized.
#[derive(Debug, Clone, Serialize)]
pub struct Discovered {
    #[serde(flatten)]
    pub metadata: TorrentMetadata,
    /// Lowercase hex.
    pub info_hash: String,
    pub magnet: String,
    pub address: IpAddr,
    pub port: u16,
}

impl Discovered {
    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

pub fn magnet_uri(info_hash_hex: &str) -> String {
    format!("magnet:?xt=urn:btih:{info_hash_hex}")
}

/// Infohashes seen recently. Entries expire after `ttl`; when full, the least
/// recently used entry goes first.
pub struct DedupCache {
    entries: LruCache<[u8; 20], Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Records `hash` and returns true, unless it was recorded less than `ttl`
    /// before `now`.
    pub fn check_and_insert(&mut self, hash: [u8; 20], now: Instant) -> bool {
        if let Some(seen) = self.entries.get(&hash) {
            if now.saturating_duration_since(*seen) < self.ttl {
                return false;
            }
        }
        self.entries.put(hash, now);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Connecting,
    Handshaking,
    Done,
    Failed,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Done | FetchState::Failed)
    }
}

struct Gate {
    dedup: DedupCache,
    // Attempts, not hashes: a hash that dedup lets through again holds its
    // own slot.
    connecting: usize,
}

/// Holds a connecting slot for one attempt; dropping it frees the slot.
struct Slot<'a> {
    gate: &'a Mutex<Gate>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut gate = lock(self.gate);
        gate.connecting = gate.connecting.saturating_sub(1);
    }
}

fn lock(gate: &Mutex<Gate>) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(|e| e.into_inner())
}

struct Attempt {
    info_hash: String,
    peer: SocketAddr,
    state: FetchState,
}

impl Attempt {
    fn advance(&mut self, next: FetchState) {
        debug_assert!(!self.state.is_terminal(), "no transition out of {:?}", self.state);
        tracing::trace!(hash = %self.info_hash, peer = %self.peer, from = ?self.state, to = ?next, "fetch: state");
        self.state = next;
    }
}

pub struct MetadataFetcher<W> {
    wire: W,
    timeout: Duration,
    max_connecting: usize,
    gate: Mutex<Gate>,
    events: mpsc::UnboundedSender<Discovered>,
}

impl<W: MetadataWire> MetadataFetcher<W> {
    pub fn new(config: &Config, wire: W, events: mpsc::UnboundedSender<Discovered>) -> Self {
        Self {
            wire,
            timeout: config.timeout,
            max_connecting: config.max_connecting_sockets.max(1),
            gate: Mutex::new(Gate {
                dedup: DedupCache::new(config.dedup_capacity, config.dedup_ttl),
                connecting: 0,
            }),
            events,
        }
    }

    /// Attempts currently connecting or handshaking.
    pub fn connecting(&self) -> usize {
        lock(&self.gate).connecting
    }

    pub fn dedup_len(&self) -> usize {
        lock(&self.gate).dedup.len()
    }

    /// Fetches and normalizes the metadata of `info_hash` from `peer`.
    ///
    /// `Ok(None)` when the attempt was shed (ceiling reached or seen recently)
    /// or the info dictionary had no name. Successful records are also sent on
    /// the events channel.
    pub async fn fetch(&self, peer: SocketAddr, info_hash: [u8; 20]) -> anyhow::Result<Option<Discovered>> {
        let Some(_slot) = self.admit(info_hash) else {
            return Ok(None);
        };

        let mut attempt = Attempt {
            info_hash: hex::encode(info_hash),
            peer,
            state: FetchState::Connecting,
        };

        // One deadline for connect and handshake together.
        let deadline = Instant::now() + self.timeout;
        let outcome = timeout_at(deadline, self.connect_and_exchange(&mut attempt, info_hash)).await;

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                let during = attempt.state;
                attempt.advance(FetchState::Failed);
                return Err(err.context(format!("{during:?} {peer}")));
            }
            Err(_elapsed) => {
                let during = attempt.state;
                attempt.advance(FetchState::Failed);
                anyhow::bail!("timed out while {during:?} {peer}");
            }
        };
        attempt.advance(FetchState::Done);

        let Some(metadata) = metadata::from_info_bytes(&raw) else {
            tracing::debug!(hash = %attempt.info_hash, peer = %peer, "fetch: info dict without a name");
            return Ok(None);
        };

        let found = Discovered {
            metadata,
            magnet: magnet_uri(&attempt.info_hash),
            info_hash: attempt.info_hash,
            address: peer.ip(),
            port: peer.port(),
        };
        tracing::debug!(hash = %found.info_hash, peer = %peer, name = %found.metadata.name, "fetch: complete");
        if self.events.send(found.clone()).is_err() {
            tracing::debug!(hash = %found.info_hash, "fetch: events receiver gone, record dropped");
        }
        Ok(Some(found))
    }

    // Check and claim happen under one lock so concurrent announces for the
    // same hash cannot both pass.
    fn admit(&self, info_hash: [u8; 20]) -> Option<Slot<'_>> {
        let mut gate = lock(&self.gate);
        if gate.connecting >= self.max_connecting {
            tracing::trace!(hash = %hex::encode(info_hash), "fetch: connection ceiling reached");
            return None;
        }
        if !gate.dedup.check_and_insert(info_hash, Instant::now()) {
            return None;
        }
        gate.connecting += 1;
        Some(Slot { gate: &self.gate })
    }

    async fn connect_and_exchange(&self, attempt: &mut Attempt, info_hash: [u8; 20]) -> anyhow::Result<Vec<u8>> {
        let stream = TcpStream::connect(attempt.peer)
            .await
            .context("connect")?;
        attempt.advance(FetchState::Handshaking);
        // The stream is consumed here; it closes as soon as the exchange ends.
        self.wire.fetch_info(stream, info_hash).await
    }
}
