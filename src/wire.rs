//! Peer-wire side of a metadata fetch.
//!
//! [`MetadataWire`] takes an already-connected stream and yields the raw
//! bencoded info dictionary. [`UtMetadataWire`] speaks BEP-3 + BEP-10 + BEP-9
//! over `rbit`'s [`PeerTransport`].

use anyhow::Context;
use bytes::Bytes;
use rbit::peer::{
    ExtensionHandshake, ExtensionMessage, Handshake, METADATA_PIECE_SIZE, Message, MetadataMessage,
    MetadataMessageType, PeerId, PeerTransport, metadata_piece_size,
};
use sha1::{Digest, Sha1};
use std::future::Future;
use tokio::net::TcpStream;

const EXT_HANDSHAKE_ID: u8 = 0;

// The id we advertise for ut_metadata; the peer addresses its replies with it.
const LOCAL_UT_METADATA_ID: u8 = 1;

const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

pub trait MetadataWire: Send + Sync + 'static {
    /// Runs the metadata exchange on `stream` and returns the info dictionary
    /// exactly as the peer sent it.
    fn fetch_info(
        &self,
        stream: TcpStream,
        info_hash: [u8; 20],
    ) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

#[derive(Debug, Clone)]
pub struct UtMetadataWire {
    peer_id: [u8; 20],
    client: String,
}

impl UtMetadataWire {
    pub fn new() -> Self {
        Self {
            peer_id: *PeerId::generate().as_bytes(),
            client: format!("dhtscout {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for UtMetadataWire {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataWire for UtMetadataWire {
    async fn fetch_info(&self, stream: TcpStream, info_hash: [u8; 20]) -> anyhow::Result<Vec<u8>> {
        let mut conn = PeerTransport::new(stream);

        conn.send_handshake(&Handshake::new(info_hash, self.peer_id))
            .await?;
        let theirs = conn
            .receive_handshake()
            .await
            .context("read peer handshake")?;
        if theirs.info_hash != info_hash {
            anyhow::bail!("peer answered for a different info hash");
        }
        if !theirs.supports_extension_protocol() {
            anyhow::bail!("peer does not support BEP-10");
        }

        let mut hs = ExtensionHandshake::with_extensions(&[("ut_metadata", LOCAL_UT_METADATA_ID)]);
        hs.client = Some(self.client.clone());
        let payload = hs.encode()?;
        conn.send_message(&Message::Extended {
            id: EXT_HANDSHAKE_ID,
            payload,
        })
        .await?;

        let (ut_metadata_id, advertised) = wait_for_peer_handshake(&mut conn).await?;

        // Without metadata_size, piece 0 tells us the total.
        let mut first_piece: Option<Bytes> = None;
        let total_size = match advertised {
            Some(size) => size as usize,
            None => {
                request_piece(&mut conn, ut_metadata_id, 0).await?;
                let msg = recv_metadata_msg(&mut conn).await?;
                if msg.msg_type != MetadataMessageType::Data || msg.piece != 0 {
                    anyhow::bail!("peer did not send metadata piece 0");
                }
                let total = msg.total_size.context("missing metadata total_size")? as usize;
                first_piece = msg.data;
                total
            }
        };
        if total_size == 0 || total_size > MAX_METADATA_SIZE {
            anyhow::bail!("unreasonable metadata size {total_size}");
        }

        let piece_count = total_size.div_ceil(METADATA_PIECE_SIZE);
        let mut pieces: Vec<Option<Bytes>> = vec![None; piece_count];
        let skip_first = first_piece.is_some();
        pieces[0] = first_piece;

        for piece in usize::from(skip_first)..piece_count {
            request_piece(&mut conn, ut_metadata_id, piece as u32).await?;
        }

        while pieces.iter().any(|p| p.is_none()) {
            let msg = recv_metadata_msg(&mut conn).await?;
            if msg.msg_type == MetadataMessageType::Reject {
                anyhow::bail!("peer rejected metadata piece {}", msg.piece);
            }
            if msg.msg_type != MetadataMessageType::Data {
                continue;
            }
            let Some(data) = msg.data else {
                continue;
            };
            if let Some(slot) = pieces.get_mut(msg.piece as usize) {
                *slot = Some(data);
            }
        }

        let info = assemble(pieces, total_size)?;
        let digest: [u8; 20] = Sha1::digest(&info).into();
        if digest != info_hash {
            anyhow::bail!("metadata hash mismatch");
        }
        Ok(info)
    }
}

async fn wait_for_peer_handshake(conn: &mut PeerTransport) -> anyhow::Result<(u8, Option<u32>)> {
    loop {
        let Message::Extended { id, payload } = conn.receive_message().await? else {
            continue;
        };
        if id != EXT_HANDSHAKE_ID {
            continue;
        }
        let ExtensionMessage::Handshake(peer_hs) = ExtensionMessage::decode(id, payload.as_ref())? else {
            continue;
        };

        let Some(ut_id) = peer_hs.get_extension_id("ut_metadata") else {
            anyhow::bail!("peer did not advertise ut_metadata");
        };

        let total = peer_hs.metadata_size.and_then(|v| u32::try_from(v).ok());
        return Ok((ut_id, total));
    }
}

async fn request_piece(conn: &mut PeerTransport, ut_metadata_id: u8, piece: u32) -> anyhow::Result<()> {
    let payload = MetadataMessage::request(piece).encode()?;
    conn.send_message(&Message::Extended {
        id: ut_metadata_id,
        payload,
    })
    .await?;
    Ok(())
}

// Peers interleave bitfield/have/choke/keep-alive while we wait; skip them.
async fn recv_metadata_msg(conn: &mut PeerTransport) -> anyhow::Result<MetadataMessage> {
    loop {
        let Message::Extended { id, payload } = conn.receive_message().await? else {
            continue;
        };
        if id != LOCAL_UT_METADATA_ID {
            continue;
        }
        return Ok(MetadataMessage::decode(payload.as_ref())?);
    }
}

fn assemble(pieces: Vec<Option<Bytes>>, total_size: usize) -> anyhow::Result<Vec<u8>> {
    let mut out = vec![0u8; total_size];
    for (piece, maybe_data) in pieces.into_iter().enumerate() {
        let data = maybe_data.context("missing piece data")?;
        let expected = metadata_piece_size(piece as u32, total_size);
        if data.len() < expected {
            anyhow::bail!("metadata piece {piece} is short");
        }
        let offset = piece * METADATA_PIECE_SIZE;
        out[offset..offset + expected].copy_from_slice(&data[..expected]);
    }
    Ok(out)
}
