//! # Broadcast Instance
//!
//! Connectionless datagrams on a LAN broadcast address. Send and receive
//! are enabled independently; receiving is catch-all and deliberately does
//! not filter by origin, so anything arriving on the bound port is
//! delivered. The socket carries `SO_BROADCAST`, and `SO_REUSEADDR` when
//! the profile asks for a reusable port (several listeners on one
//! machine).

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

use crate::addr::NetAddress;
use crate::error::{NetError, Result};
use crate::packet::Packet;
use crate::profile::Profile;
use crate::transport::datagram::{bind_udp, DatagramConfig, DatagramEndpoint, DatagramMode};
use crate::transport::{RecvCallback, SendStatus};

pub(crate) struct BroadcastInstance {
    endpoint: Arc<DatagramEndpoint>,
    target: SocketAddr,
    send_enabled: bool,
    recv_enabled: bool,
    profile: Profile,
}

impl BroadcastInstance {
    /// Bind the broadcast socket. `addr` is both the send target and, when
    /// no explicit local bind is profiled, the port receives arrive on.
    pub(crate) async fn start(
        instance_id: usize,
        addr: NetAddress,
        send_enabled: bool,
        recv_enabled: bool,
        profile: Profile,
        handle: Handle,
    ) -> Result<BroadcastInstance> {
        profile.validate()?;
        if !send_enabled && !recv_enabled {
            return Err(NetError::InvalidProfile(
                "broadcast needs send, receive or both enabled".into(),
            ));
        }
        let target: SocketAddr = addr.into();
        let local: SocketAddr = if profile.local_udp().is_unset() {
            // Receivers must sit on the broadcast port; pure senders can
            // take any ephemeral port.
            if recv_enabled {
                format!("0.0.0.0:{}", target.port()).parse().unwrap()
            } else {
                "0.0.0.0:0".parse().unwrap()
            }
        } else {
            profile.local_udp().into()
        };

        let socket = bind_udp(local, profile.reusable_udp(), true).await?;
        let config = DatagramConfig {
            // Broadcast is catch-all by definition; the demux modes only
            // make sense with a handshake behind them.
            mode: DatagramMode::CatchAll,
            num_operations: 1,
            max_clients: 0,
            recv_buffer: profile.recv_size_udp(),
            recv_cap: profile.recv_cap_udp(),
            send_cap: profile.send_cap_udp(),
            send_timeout: profile.send_timeout(),
            decrypt_key: None,
            recycle_depth: profile.recycle_depth(),
            verify_source: false,
        };
        let endpoint = DatagramEndpoint::spawn(socket, config, instance_id, &handle);
        info!(
            instance = instance_id,
            %target,
            send_enabled,
            recv_enabled,
            "broadcast endpoint started"
        );
        Ok(BroadcastInstance {
            endpoint,
            target,
            send_enabled,
            recv_enabled,
            profile,
        })
    }

    pub(crate) fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Send `payload` to the broadcast address.
    pub(crate) async fn send(&self, payload: &[u8], block: bool) -> Result<SendStatus> {
        if !self.send_enabled {
            return Err(NetError::Shutdown);
        }
        self.endpoint
            .send_raw(payload.to_vec(), Some(self.target), block)
            .await
    }

    /// Send `payload` to an explicit address through the broadcast socket.
    pub(crate) async fn send_to(
        &self,
        payload: &[u8],
        target: NetAddress,
        block: bool,
    ) -> Result<SendStatus> {
        if !self.send_enabled {
            return Err(NetError::Shutdown);
        }
        self.endpoint
            .send_raw(payload.to_vec(), Some(target.into()), block)
            .await
    }

    /// Pop the next received datagram.
    pub(crate) fn recv(&self) -> Result<Option<Packet>> {
        if !self.recv_enabled {
            return Err(NetError::Shutdown);
        }
        self.endpoint.recv(0, 0)
    }

    pub(crate) fn set_recv_callback(&self, callback: Option<RecvCallback>) {
        self.endpoint.set_recv_callback(callback);
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub(crate) fn target(&self) -> SocketAddr {
        self.target
    }

    pub(crate) fn store_amount(&self) -> usize {
        self.endpoint.queue_len(0, 0)
    }

    pub(crate) fn send_inflight(&self) -> usize {
        self.endpoint.send_inflight()
    }

    pub(crate) fn flush_recv(&self) -> usize {
        self.endpoint.flush_recv(0)
    }

    pub(crate) fn finish(&self) {
        self.endpoint.close();
    }
}
