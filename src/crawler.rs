//! DHT crawler.
//!
//! Walks the Mainline DHT without keeping a routing table: every node learned
//! from a `nodes` field is asked `find_node` once, with a sender id that looks
//! close to its own. `get_peers` is answered with a token so that peers come
//! back with `announce_peer`; each valid announce becomes a fetch candidate.

use crate::config::Config;
use crate::fetch::MetadataFetcher;
use crate::krpc::{self, Krpc, KrpcError, Query, QueryKind};
use crate::node_id::{self, NodeId};
use crate::scheduler::TaskScheduler;
use crate::wire::MetadataWire;
use anyhow::Context;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval};

// Tokens are the leading bytes of the infohash; nothing else is remembered.
const TOKEN_LEN: usize = 2;

const RECV_BUF_LEN: usize = 4096;

const BOOTSTRAP_REFRESH: Duration = Duration::from_secs(10 * 60);

/// An announced swarm worth asking for metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCandidate {
    pub info_hash: [u8; 20],
    pub peer: SocketAddr,
}

/// What to do about one inbound packet.
#[derive(Debug, Default)]
pub struct Reaction {
    pub replies: Vec<(Vec<u8>, SocketAddr)>,
    pub candidate: Option<FetchCandidate>,
}

/// Protocol rules of the crawler, without sockets.
#[derive(Debug, Clone)]
pub struct Crawler {
    nid: NodeId,
    local_ip: Ipv4Addr,
    public_nodes_only: bool,
    ack_backlog_factor: usize,
    limit: usize,
}

impl Crawler {
    pub fn new(config: &Config) -> Self {
        Self::with_id(NodeId::random(), config)
    }

    pub fn with_id(nid: NodeId, config: &Config) -> Self {
        Self {
            nid,
            local_ip: config.address,
            public_nodes_only: config.public_nodes_only,
            ack_backlog_factor: config.ack_backlog_factor,
            limit: config.max_connecting_sockets.max(1),
        }
    }

    pub fn id(&self) -> NodeId {
        self.nid
    }

    /// `find_node` sent on a walk tick: our own id, random target.
    pub fn walk_query(&self) -> Result<Vec<u8>, KrpcError> {
        krpc::find_node_query(&krpc::next_tid(), &self.nid, &NodeId::random())
    }

    /// Reaction to a datagram from `from`, given the scheduler's current
    /// backlog (queued + running fetches).
    pub fn handle_packet(&self, raw: &[u8], from: SocketAddr, backlog: usize) -> Reaction {
        let msg = match Krpc::decode(raw) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::trace!(%err, from = %from, "crawler: dropped packet");
                return Reaction::default();
            }
        };

        match msg {
            Krpc::Response(resp) => Reaction {
                replies: resp
                    .nodes
                    .as_deref()
                    .map(|nodes| self.on_nodes(nodes))
                    .unwrap_or_default(),
                candidate: None,
            },
            Krpc::Query(query) => match &query.kind {
                QueryKind::GetPeers { info_hash } => Reaction {
                    replies: self.on_get_peers(&query, info_hash, from).into_iter().collect(),
                    candidate: None,
                },
                QueryKind::AnnouncePeer { .. } => self.on_announce_peer(&query, from, backlog),
                QueryKind::FindNode { .. } | QueryKind::Other(_) => Reaction::default(),
            },
        }
    }

    fn on_nodes(&self, nodes: &[u8]) -> Vec<(Vec<u8>, SocketAddr)> {
        node_id::decode_compact_nodes(nodes)
            .into_iter()
            .filter(|node| {
                *node.addr.ip() != self.local_ip
                    && node.id != self.nid
                    && node.addr.port() != 0
                    && (!self.public_nodes_only || is_publicly_routable_ip(IpAddr::V4(*node.addr.ip())))
            })
            .filter_map(|node| {
                let sender = self.nid.neighbor(node.id.as_bytes());
                match krpc::find_node_query(&krpc::next_tid(), &sender, &NodeId::random()) {
                    Ok(msg) => Some((msg, SocketAddr::V4(node.addr))),
                    Err(err) => {
                        tracing::debug!(%err, "crawler: encode find_node failed");
                        None
                    }
                }
            })
            .collect()
    }

    fn on_get_peers(&self, query: &Query, info_hash: &[u8], from: SocketAddr) -> Option<(Vec<u8>, SocketAddr)> {
        if info_hash.len() != 20 || query.sender.as_deref().and_then(NodeId::from_slice).is_none() {
            return None;
        }
        let id = self.nid.neighbor(info_hash);
        match krpc::get_peers_reply(&query.tid, &id, &info_hash[..TOKEN_LEN]) {
            Ok(msg) => Some((msg, from)),
            Err(err) => {
                tracing::debug!(%err, "crawler: encode get_peers reply failed");
                None
            }
        }
    }

    fn on_announce_peer(&self, query: &Query, from: SocketAddr, backlog: usize) -> Reaction {
        let QueryKind::AnnouncePeer {
            info_hash,
            token,
            port,
            implied_port,
        } = &query.kind
        else {
            return Reaction::default();
        };

        let Ok(info_hash) = <[u8; 20]>::try_from(info_hash.as_slice()) else {
            return Reaction::default();
        };
        if token.as_slice() != &info_hash[..TOKEN_LEN] {
            return Reaction::default();
        }

        let port = match implied_port {
            Some(n) if *n != 0 => i64::from(from.port()),
            _ => port.unwrap_or(0),
        };
        let Some(port) = u16::try_from(port).ok().filter(|p| *p != 0) else {
            return Reaction::default();
        };

        let mut reaction = Reaction {
            replies: Vec::new(),
            candidate: Some(FetchCandidate {
                info_hash,
                peer: SocketAddr::new(from.ip(), port),
            }),
        };

        // Stop acknowledging once the fetch backlog is deep; the announce is
        // still taken.
        if backlog < self.ack_backlog_factor.saturating_mul(self.limit) {
            let sender = query.sender.as_deref().unwrap_or_default();
            match krpc::announce_peer_ack(&query.tid, &self.nid.neighbor(sender)) {
                Ok(msg) => reaction.replies.push((msg, from)),
                Err(err) => tracing::debug!(%err, "crawler: encode announce_peer ack failed"),
            }
        }
        reaction
    }
}

fn is_publicly_routable_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_loopback() || v4.is_unspecified() {
                return false;
            }
            if v4.is_link_local() || v4.is_multicast() || v4.is_broadcast() {
                return false;
            }

            // Documentation and benchmark ranges.
            let o = v4.octets();
            if (o[0] == 192 && o[1] == 0 && o[2] == 2)
                || (o[0] == 198 && o[1] == 51 && o[2] == 100)
                || (o[0] == 203 && o[1] == 0 && o[2] == 113)
                || (o[0] == 198 && (o[1] == 18 || o[1] == 19))
            {
                return false;
            }

            true
        }
        // Compact node info is IPv4 only.
        IpAddr::V6(_) => false,
    }
}

/// The crawler bound to its UDP socket, feeding announces to the fetcher
/// through the scheduler.
pub struct DhtCrawler<W> {
    socket: UdpSocket,
    crawler: Crawler,
    scheduler: TaskScheduler,
    fetcher: Arc<MetadataFetcher<W>>,
    bootstrap_hosts: Vec<String>,
    // One entry per host, `None` while it does not resolve. Refreshed off the
    // receive loop.
    bootstrap: watch::Receiver<Vec<Option<SocketAddr>>>,
    bootstrap_tx: Option<watch::Sender<Vec<Option<SocketAddr>>>>,
    bootstrap_index: usize,
    walk_interval: Duration,
}

impl<W: MetadataWire> DhtCrawler<W> {
    pub async fn bind(
        config: &Config,
        scheduler: TaskScheduler,
        fetcher: Arc<MetadataFetcher<W>>,
    ) -> anyhow::Result<Self> {
        let bind = SocketAddr::new(IpAddr::V4(config.address), config.port);
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("bind udp {bind}"))?;

        let bootstrap_hosts = config.bootstrap_nodes.clone();
        let (bootstrap_tx, bootstrap) = watch::channel(resolve_all(&bootstrap_hosts).await);

        Ok(Self {
            socket,
            crawler: Crawler::new(config),
            scheduler,
            fetcher,
            bootstrap_hosts,
            bootstrap,
            bootstrap_tx: Some(bootstrap_tx),
            bootstrap_index: 0,
            walk_interval: config.walk_interval,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn id(&self) -> NodeId {
        self.crawler.id()
    }

    /// Runs the walk and serves inbound packets. Only returns if the socket
    /// becomes unusable.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Ok(addr) = self.socket.local_addr() {
            tracing::info!(bind = %addr, id = %self.crawler.id(), "crawler: listening");
        }
        if let Some(tx) = self.bootstrap_tx.take() {
            tokio::spawn(refresh_bootstrap(self.bootstrap_hosts.clone(), tx));
        }

        let mut walk = interval(self.walk_interval);
        walk.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUF_LEN];

        loop {
            tokio::select! {
                _ = walk.tick() => {
                    self.walk_tick().await;
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match recv {
                        Ok(r) => r,
                        // ICMP unreachable from an earlier send surfaces here on some
                        // platforms.
                        Err(err) => {
                            tracing::debug!(%err, "crawler: recv failed");
                            continue;
                        }
                    };
                    if n == 0 {
                        continue;
                    }
                    let reaction = self
                        .crawler
                        .handle_packet(&buf[..n], from, self.scheduler.remaining_len());
                    self.react(reaction).await;
                }
            }
        }
    }

    async fn walk_tick(&mut self) {
        if self.scheduler.remaining_len() >= self.scheduler.limit() {
            return;
        }
        let target = {
            let resolved = self.bootstrap.borrow();
            if resolved.is_empty() {
                return;
            }
            resolved[self.bootstrap_index % resolved.len()]
        };
        self.bootstrap_index = self.bootstrap_index.wrapping_add(1);

        let Some(addr) = target else {
            return;
        };
        match self.crawler.walk_query() {
            Ok(msg) => self.send(&msg, addr).await,
            Err(err) => tracing::debug!(%err, "crawler: encode find_node failed"),
        }
    }

    async fn react(&self, reaction: Reaction) {
        for (msg, to) in &reaction.replies {
            self.send(msg, *to).await;
        }

        if let Some(FetchCandidate { info_hash, peer }) = reaction.candidate {
            tracing::debug!(hash = %hex::encode(info_hash), peer = %peer, "crawler: announce");
            let fetcher = Arc::clone(&self.fetcher);
            // Fire and forget: the outcome only matters to the events channel.
            drop(self.scheduler.submit(move || async move {
                if let Err(err) = fetcher.fetch(peer, info_hash).await {
                    tracing::debug!(err = %format!("{err:#}"), hash = %hex::encode(info_hash), "fetch: failed");
                }
                Ok(())
            }));
        }
    }

    async fn send(&self, msg: &[u8], to: SocketAddr) {
        if to.port() == 0 {
            return;
        }
        if let Err(err) = self.socket.send_to(msg, to).await {
            tracing::debug!(%err, to = %to, "crawler: send failed");
        }
    }
}

async fn resolve_bootstrap(host: &str) -> Option<SocketAddr> {
    match tokio::net::lookup_host(host).await {
        Ok(mut addrs) => {
            let addr = addrs.find(SocketAddr::is_ipv4);
            if addr.is_none() {
                tracing::debug!(host = %host, "crawler: bootstrap has no ipv4 address");
            }
            addr
        }
        Err(err) => {
            tracing::debug!(%err, host = %host, "crawler: bootstrap resolve failed");
            None
        }
    }
}

async fn resolve_all(hosts: &[String]) -> Vec<Option<SocketAddr>> {
    let mut out = Vec::with_capacity(hosts.len());
    for host in hosts {
        out.push(resolve_bootstrap(host).await);
    }
    out
}

// Re-resolves the bootstrap hosts until the crawler goes away.
async fn refresh_bootstrap(hosts: Vec<String>, tx: watch::Sender<Vec<Option<SocketAddr>>>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(BOOTSTRAP_REFRESH) => {}
            _ = tx.closed() => return,
        }
        let resolved = resolve_all(&hosts).await;
        if tx.send(resolved).is_err() {
            return;
        }
    }
}
