//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable-ordered (TCP) and best-effort (UDP) channel.
//! - Define every message exchanged between the session server and its peers.
//! - Keep serialization explicit and versionable.
//!
//! Reliability and ordering come entirely from TCP; nothing here retries.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::{ecs::EntityId, math::Pose};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a single reliable frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Reliable, ordered per peer.
    Reliable,
    /// Best-effort; may be dropped or reordered.
    Unreliable,
}

/// Why an entity died.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DamageCause {
    /// Free-form damage type, e.g. `"fall"` or `"rocket"`.
    pub kind: String,
    /// Entity responsible for the damage, if any.
    pub instigator: Option<EntityId>,
}

impl DamageCause {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            instigator: None,
        }
    }

    pub fn with_instigator(mut self, instigator: EntityId) -> Self {
        self.instigator = Some(instigator);
        self
    }
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        connection: ConnectionId,
    },

    // ─── Scene transitions ───
    /// Server tells the peer which scene to load for this generation.
    LoadScene {
        scene_name: String,
        generation: u32,
    },
    /// Peer finished loading the scene of `generation`.
    LoadSceneDone {
        generation: u32,
    },

    // ─── Entity replication ───
    /// Introduces an entity to a peer before it appears in snapshots.
    EntitySpawn(EntitySpawn),
    /// Periodic authoritative state.
    EntitySnapshot(EntitySnapshot),
    /// Sent once when an entity is torn down.
    EntityDestroyed {
        entity: EntityId,
        death_cause: Option<DamageCause>,
    },
    /// Owner-only signal: your entity took non-lethal damage.
    OwnerHurt {
        entity: EntityId,
    },

    // ─── Console ───
    /// Server -> client: print message to console.
    ServerPrint {
        message: String,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

impl NetMsg {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NetMsg::Hello { .. } => "Hello",
            NetMsg::UdpHello { .. } => "UdpHello",
            NetMsg::Welcome { .. } => "Welcome",
            NetMsg::LoadScene { .. } => "LoadScene",
            NetMsg::LoadSceneDone { .. } => "LoadSceneDone",
            NetMsg::EntitySpawn(_) => "EntitySpawn",
            NetMsg::EntitySnapshot(_) => "EntitySnapshot",
            NetMsg::EntityDestroyed { .. } => "EntityDestroyed",
            NetMsg::OwnerHurt { .. } => "OwnerHurt",
            NetMsg::ServerPrint { .. } => "ServerPrint",
            NetMsg::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Entity introduction packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    /// Connection controlling this entity, if it is a player pawn.
    pub owner: Option<ConnectionId>,
    pub max_health: u8,
    pub health: u8,
    pub pose: Pose,
}

/// Replicated state of one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub id: EntityId,
    pub health: u8,
    pub pose: Pose,
}

/// World snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub tick: u32,
    pub entities: Vec<EntityState>,
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves so a reader
    /// task and a writer task can serve the same peer.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (r, w) = self.stream.into_split();
        (ReliableReader { half: r }, ReliableWriter { half: w })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.half, msg).await
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
