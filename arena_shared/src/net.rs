//! Networking primitives.
//!
//! Goals:
//! - Provide a simple reliable (TCP) link used as the local connection provider.
//! - Provide the replication and remote-call message types used by client/server.
//! - Keep serialization explicit and versionable.
//!
//! Frames are a big-endian `u32` length followed by a JSON payload. Relay
//! transports are opaque to this module; see [`crate::relay`].

use std::{io, net::SocketAddr};

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{
    ecs::EntityId,
    math::Vec3,
    relay::JoinCode,
    rpc::RpcCall,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Identifies a connected client. Stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Players pick an appearance and ready up.
    Lobby,
    /// Clients are loading the gameplay scene.
    AwaitingSceneLoad,
    /// Avatars are spawned and the round is running.
    Gameplay,
}

/// Session facts sent with the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub join_code: Option<JoinCode>,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
}

/// Replicated fields of a player session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlayerField {
    IsReady(bool),
    Appearance(i32),
    Health(i32),
}

/// A single replicated field change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldUpdate {
    pub client_id: ClientId,
    pub field: PlayerField,
}

/// Full replicated view of one player, sent on join and on handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerState {
    pub client_id: ClientId,
    pub is_ready: bool,
    pub appearance: i32,
    pub health: i32,
    pub avatar: Option<EntityId>,
}

/// Kind of networked entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntityKind {
    Avatar,
    Projectile,
}

/// Entity spawn packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Owning client. Projectiles carry the shooter here.
    pub owner: Option<ClientId>,
    pub position: Vec3,
}

/// A minimal entity state for replication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub id: EntityId,
    pub position: Vec3,
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    Welcome {
        client_id: ClientId,
        session: SessionInfo,
    },

    // ─── Remote calls (both directions) ───
    Rpc(RpcCall),

    // ─── Session replication ───
    PlayerJoined(PlayerState),
    PlayerLeft {
        client_id: ClientId,
    },
    FieldUpdate(FieldUpdate),
    PhaseChanged {
        phase: Phase,
    },

    // ─── Entity replication ───
    EntitySpawned(EntitySpawn),
    EntityMoved(EntityState),
    EntityDespawned {
        id: EntityId,
    },

    // ─── Failure / disconnect ───
    /// Session-wide failure notification.
    SessionFailure {
        reason: String,
    },
    Disconnect {
        reason: String,
    },
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Option<NetMsg>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("tcp read len"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame too large: {len} bytes");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(Some(msg))
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

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    /// Receives the next message, failing if the peer closed.
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        match read_frame(&mut self.stream).await? {
            Some(msg) => Ok(msg),
            None => bail!("connection closed"),
        }
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (r, w) = self.stream.into_split();
        (FrameReader { inner: r }, FrameWriter { inner: w })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
}

impl FrameReader {
    /// `Ok(None)` on clean close.
    pub async fn recv(&mut self) -> anyhow::Result<Option<NetMsg>> {
        read_frame(&mut self.inner).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.inner, msg).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.inner.shutdown().await.context("tcp shutdown")?;
        Ok(())
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
        stream.set_nodelay(true).context("tcp nodelay")?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{procedures, RpcArgs};

    #[test]
    fn rpc_call_survives_bytes() {
        let msg = NetMsg::Rpc(RpcCall::new(
            procedures::REQUEST_SHOOT,
            RpcArgs::Shoot {
                origin: Vec3::new(1.0, 2.0, 0.0),
                direction: Vec3::new(0.0, 1.0, 0.0),
            },
        ));
        let bytes = encode_to_bytes(&msg).unwrap();
        assert_eq!(decode_from_bytes(&bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn frames_over_loopback() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await?;
            let (mut reader, mut writer) = conn.into_split();
            let first = reader.recv().await?;
            writer
                .send(&NetMsg::PhaseChanged {
                    phase: Phase::Gameplay,
                })
                .await?;
            let after_close = reader.recv().await?;
            Ok::<_, anyhow::Error>((first, after_close))
        });

        let mut client = ReliableConn::connect(addr).await?;
        client
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        assert_eq!(
            client.recv().await?,
            NetMsg::PhaseChanged {
                phase: Phase::Gameplay
            }
        );
        drop(client);

        let (first, after_close) = server.await??;
        assert_eq!(
            first,
            Some(NetMsg::Hello {
                protocol: PROTOCOL_VERSION
            })
        );
        assert_eq!(after_close, None);
        Ok(())
    }
}
