//! # Admission Handshake
//!
//! Before a client exchanges any application traffic with a server, the two
//! run a short exchange over the freshly opened stream:
//!
//! 1. Server sends `Hello` carrying the protocol version, the table sizes
//!    the client must mirror (`max_clients`, `num_operations`), whether UDP
//!    is in play, and the client id drawn from the server's free pool —
//!    or `Reject(Full)` when the pool is empty.
//! 2. Client answers `HelloAck` with its own version and the local port its
//!    UDP socket is bound to. A version mismatch earns `Reject(Version)`.
//! 3. When UDP is enabled, the client fires a probe datagram at the
//!    server's UDP endpoint. The *source address the server observes* —
//!    not anything the client claims — becomes the client's trusted
//!    datagram address.
//! 4. Server sends `Ready`. Only now does the client surface through
//!    `client_joined` and become eligible for normal traffic.
//!
//! Control messages are bincode-encoded and length-prefix framed
//! regardless of the connection's payload framing mode, so both ends can
//! find handshake boundaries before the payload framing is in effect. The
//! whole exchange is bounded by the server's handshake timeout; a peer
//! that stalls is closed silently and never becomes observable.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{NetError, Result};

/// Version of the admission protocol and the demux headers.
pub const PROTOCOL_VERSION: u32 = 2;

/// First four bytes of a probe datagram, little-endian.
pub(crate) const PROBE_MAGIC: u32 = 0x4b4e_494c; // "LINK"

/// Probe datagrams are exactly magic + client id.
pub(crate) const PROBE_LEN: usize = 12;

/// Control messages never legitimately exceed this.
const MAX_CONTROL_LEN: usize = 4096;

/// Why a server turned a connection away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Every client id is in use.
    Full,
    /// Protocol version mismatch.
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ControlMessage {
    Hello {
        protocol_version: u32,
        max_clients: u64,
        num_operations: u64,
        udp_enabled: bool,
        client_id: u64,
    },
    HelloAck {
        protocol_version: u32,
        udp_port: u16,
    },
    Reject(RejectReason),
    Ready,
}

/// Frame and send one control message: `u32` length prefix (native byte
/// order, same as payload prefix framing) then the bincode body.
pub(crate) async fn write_control<W>(writer: &mut W, message: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)
        .map_err(|e| NetError::Protocol(format!("control message encoding failed: {e}")))?;
    writer.write_all(&(body.len() as u32).to_ne_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed control message.
pub(crate) async fn read_control<R>(reader: &mut R) -> Result<ControlMessage>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_ne_bytes(prefix) as usize;
    if len > MAX_CONTROL_LEN {
        return Err(NetError::Protocol(format!(
            "control message of {len} bytes exceeds the {MAX_CONTROL_LEN} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map_err(|e| NetError::Protocol(format!("malformed control message: {e}")))
}

/// The wire bytes of a probe datagram for `client_id`.
pub(crate) fn probe_bytes(client_id: u64) -> [u8; PROBE_LEN] {
    let mut probe = [0u8; PROBE_LEN];
    probe[..4].copy_from_slice(&PROBE_MAGIC.to_le_bytes());
    probe[4..].copy_from_slice(&client_id.to_le_bytes());
    probe
}

/// What a successful handshake tells the client.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Admission {
    pub client_id: u64,
    pub max_clients: usize,
    pub num_operations: usize,
    pub udp_enabled: bool,
}

/// Run the client side of the handshake on a connected stream.
///
/// When the server enables UDP and `udp` is provided, the probe is sent
/// through it; the socket must already be connected to the server's UDP
/// endpoint so the server observes the right source address.
pub(crate) async fn client_handshake<S>(
    stream: &mut S,
    udp: Option<&UdpSocket>,
) -> Result<Admission>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = match read_control(stream).await? {
        ControlMessage::Hello {
            protocol_version,
            max_clients,
            num_operations,
            udp_enabled,
            client_id,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(NetError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: protocol_version,
                });
            }
            Admission {
                client_id,
                max_clients: max_clients as usize,
                num_operations: num_operations as usize,
                udp_enabled,
            }
        }
        ControlMessage::Reject(RejectReason::Full) => return Err(NetError::ServerFull),
        ControlMessage::Reject(RejectReason::Version) => {
            return Err(NetError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: 0,
            })
        }
        other => {
            return Err(NetError::Protocol(format!(
                "expected Hello, got {other:?}"
            )))
        }
    };

    let udp_port = match udp {
        Some(socket) => socket.local_addr()?.port(),
        None => 0,
    };
    write_control(
        stream,
        &ControlMessage::HelloAck {
            protocol_version: PROTOCOL_VERSION,
            udp_port,
        },
    )
    .await?;

    if hello.udp_enabled {
        if let Some(socket) = udp {
            socket.send(&probe_bytes(hello.client_id)).await?;
            debug!(client_id = hello.client_id, "handshake probe sent");
        }
    }

    match read_control(stream).await? {
        ControlMessage::Ready => Ok(hello),
        ControlMessage::Reject(RejectReason::Version) => Err(NetError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: 0,
        }),
        ControlMessage::Reject(RejectReason::Full) => Err(NetError::ServerFull),
        other => Err(NetError::Protocol(format!(
            "expected Ready, got {other:?}"
        ))),
    }
}

/// Run the server side of the handshake on an accepted stream.
///
/// `client_id` has already been drawn from the free pool; the caller
/// returns it on failure. `probe` resolves to the source address of the
/// client's probe datagram and is awaited only when UDP is enabled. The
/// caller wraps the whole call in the handshake timeout.
///
/// Returns the client's verified UDP address (`None` when UDP is off).
pub(crate) async fn server_handshake<S, P>(
    stream: &mut S,
    client_id: u64,
    max_clients: usize,
    num_operations: usize,
    udp_enabled: bool,
    probe: P,
) -> Result<Option<SocketAddr>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Future<Output = Option<SocketAddr>>,
{
    write_control(
        stream,
        &ControlMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            max_clients: max_clients as u64,
            num_operations: num_operations as u64,
            udp_enabled,
            client_id,
        },
    )
    .await?;

    match read_control(stream).await? {
        ControlMessage::HelloAck {
            protocol_version, ..
        } => {
            if protocol_version != PROTOCOL_VERSION {
                let _ = write_control(stream, &ControlMessage::Reject(RejectReason::Version)).await;
                return Err(NetError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: protocol_version,
                });
            }
        }
        other => {
            return Err(NetError::Protocol(format!(
                "expected HelloAck, got {other:?}"
            )))
        }
    }

    let udp_addr = if udp_enabled {
        match probe.await {
            Some(addr) => {
                debug!(client_id, %addr, "probe received, UDP address bound");
                Some(addr)
            }
            None => return Err(NetError::HandshakeTimeout),
        }
    } else {
        None
    };

    write_control(stream, &ControlMessage::Ready).await?;
    Ok(udp_addr)
}

/// Turn a full server's connection away and say why.
pub(crate) async fn reject<S>(stream: &mut S, reason: RejectReason) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_control(stream, &ControlMessage::Reject(reason)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_messages_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let messages = [
            ControlMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                max_clients: 16,
                num_operations: 3,
                udp_enabled: true,
                client_id: 7,
            },
            ControlMessage::HelloAck {
                protocol_version: PROTOCOL_VERSION,
                udp_port: 4242,
            },
            ControlMessage::Reject(RejectReason::Full),
            ControlMessage::Ready,
        ];
        for message in &messages {
            write_control(&mut a, message).await.unwrap();
            assert_eq!(&read_control(&mut b).await.unwrap(), message);
        }
    }

    #[tokio::test]
    async fn oversize_control_message_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&(1_000_000u32).to_ne_bytes()).await;
        });
        assert!(matches!(
            read_control(&mut b).await,
            Err(NetError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn full_exchange_without_udp() {
        let (mut server, mut client) = tokio::io::duplex(1024);
        let server_side = tokio::spawn(async move {
            server_handshake(&mut server, 3, 8, 2, false, async { None }).await
        });
        let admission = client_handshake(&mut client, None).await.unwrap();
        assert_eq!(admission.client_id, 3);
        assert_eq!(admission.max_clients, 8);
        assert_eq!(admission.num_operations, 2);
        assert!(!admission.udp_enabled);
        assert_eq!(server_side.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (mut server, mut client) = tokio::io::duplex(1024);
        let server_side = tokio::spawn(async move {
            server_handshake(&mut server, 1, 4, 1, false, async { None }).await
        });
        // A hand-rolled ack with the wrong version.
        match read_control(&mut client).await.unwrap() {
            ControlMessage::Hello { .. } => {}
            other => panic!("expected Hello, got {other:?}"),
        }
        write_control(
            &mut client,
            &ControlMessage::HelloAck {
                protocol_version: PROTOCOL_VERSION + 1,
                udp_port: 0,
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            server_side.await.unwrap(),
            Err(NetError::VersionMismatch { .. })
        ));
        assert!(matches!(
            read_control(&mut client).await.unwrap(),
            ControlMessage::Reject(RejectReason::Version)
        ));
    }

    #[tokio::test]
    async fn rejected_client_reports_server_full() {
        let (mut server, mut client) = tokio::io::duplex(1024);
        tokio::spawn(async move { reject(&mut server, RejectReason::Full).await });
        assert!(matches!(
            client_handshake(&mut client, None).await,
            Err(NetError::ServerFull)
        ));
    }

    #[test]
    fn probe_bytes_layout() {
        let probe = probe_bytes(0x0102);
        assert_eq!(probe.len(), PROBE_LEN);
        assert_eq!(u32::from_le_bytes(probe[..4].try_into().unwrap()), PROBE_MAGIC);
        assert_eq!(u64::from_le_bytes(probe[4..].try_into().unwrap()), 0x0102);
    }
}
