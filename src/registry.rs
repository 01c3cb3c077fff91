//! # Instance Registry
//!
//! The [`Registry`] owns everything: a fixed table of instance slots and
//! the shared worker pool that drives their I/O. Instances are addressed
//! by dense integer ids in `[0, num_instances)`; an id names a slot in
//! this table and never memory.
//!
//! Lookups take the table's read lock; starting and finishing instances
//! take the write lock. Blocking entry points drive the pool's runtime, so
//! with `num_threads == 0` every blocking call is also what makes
//! background work progress.
//!
//! ## Poll-style surface
//!
//! The hot-path calls return plain statuses (`ConnectionStatus`,
//! `SendStatus`, `0` id sentinels). When such a call fails, the detailed
//! error lands in the calling thread's last-error slot — see
//! [`crate::take_last_error`].

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::addr::{NetAddress, UNSET};
use crate::crypto::CipherStatus;
use crate::error::{self, NetError, Result};
use crate::instance::broadcast::BroadcastInstance;
use crate::instance::client::ClientInstance;
use crate::instance::server::ServerInstance;
use crate::instance::{Instance, InstanceType};
use crate::packet::Packet;
use crate::pool::CompletionPool;
use crate::profile::Profile;
use crate::transport::{ConnectionStatus, RecvCallback, SendStatus};

fn kind_str(kind: InstanceType) -> &'static str {
    match kind {
        InstanceType::Inactive => "inactive",
        InstanceType::Client => "client",
        InstanceType::Server => "server",
        InstanceType::Broadcast => "broadcast",
    }
}

fn to_net(addr: SocketAddr) -> NetAddress {
    NetAddress::try_from(addr).unwrap_or(UNSET)
}

/// Owner of all instances and the worker pool.
pub struct Registry {
    pool: CompletionPool,
    slots: RwLock<Vec<Instance>>,
}

impl Registry {
    /// Start the library: `num_instances` slots served by `num_threads`
    /// workers (`0` = caller-driven runtime, for deterministic tests).
    pub fn start(num_instances: usize, num_threads: usize) -> Result<Registry> {
        let pool = CompletionPool::new(num_threads)?;
        let slots = (0..num_instances).map(|_| Instance::Inactive).collect();
        info!(num_instances, num_threads, "registry started");
        Ok(Registry {
            pool,
            slots: RwLock::new(slots),
        })
    }

    /// Number of instance slots.
    pub fn num_instances(&self) -> usize {
        self.slots.read().len()
    }

    /// Worker threads backing the pool.
    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// What currently occupies slot `id`.
    pub fn instance_type(&self, id: usize) -> InstanceType {
        self.slots
            .read()
            .get(id)
            .map(Instance::kind)
            .unwrap_or(InstanceType::Inactive)
    }

    /// Tear down one instance, waiting for its connections to die, and
    /// return its slot to `Inactive`.
    pub fn finish(&self, id: usize) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id).ok_or(NetError::InvalidInstance(id))?;
        let instance = std::mem::replace(slot, Instance::Inactive);
        drop(slots);
        match instance {
            Instance::Inactive => {}
            Instance::Client(client) => client.disconnect(),
            Instance::Server(server) => self.pool.block_on(server.finish()),
            Instance::Broadcast(broadcast) => broadcast.finish(),
        }
        Ok(())
    }

    /// Tear down every instance. The pool itself survives until the
    /// registry is dropped.
    pub fn finish_all(&self) {
        for id in 0..self.num_instances() {
            let _ = self.finish(id);
        }
    }

    // ---- instance construction ------------------------------------------

    /// Turn slot `id` into a client and connect it.
    ///
    /// With `block = true` the call returns the final status of the whole
    /// connect + handshake; otherwise it returns
    /// [`ConnectionStatus::StillConnecting`] and progress is observed via
    /// [`Registry::poll_connect`].
    pub fn connect(
        &self,
        id: usize,
        tcp: NetAddress,
        udp: Option<NetAddress>,
        timeout: Duration,
        block: bool,
        profile: Profile,
    ) -> Result<ConnectionStatus> {
        {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(id).ok_or(NetError::InvalidInstance(id))?;
            match slot {
                Instance::Inactive => {
                    *slot = Instance::Client(ClientInstance::new(
                        id,
                        profile,
                        self.pool.handle().clone(),
                    )?);
                }
                Instance::Client(_) => {}
                other => {
                    return Err(NetError::WrongInstanceType {
                        id,
                        actual: kind_str(other.kind()),
                        required: "client or inactive",
                    })
                }
            }
        }
        self.with_client(id, |client| {
            self.pool.block_on(client.connect(tcp, udp, timeout, block))
        })
    }

    /// Turn slot `id` into a server listening per `profile`.
    pub fn start_server(&self, id: usize, max_clients: usize, profile: Profile) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id).ok_or(NetError::InvalidInstance(id))?;
        if !matches!(slot, Instance::Inactive) {
            return Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(slot.kind()),
                required: "inactive",
            });
        }
        let server = self.pool.block_on(ServerInstance::start(
            id,
            max_clients,
            profile,
            self.pool.handle().clone(),
        ))?;
        *slot = Instance::Server(server);
        Ok(())
    }

    /// Turn slot `id` into a broadcast endpoint.
    pub fn start_broadcast(
        &self,
        id: usize,
        addr: NetAddress,
        send_enabled: bool,
        recv_enabled: bool,
        profile: Profile,
    ) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id).ok_or(NetError::InvalidInstance(id))?;
        if !matches!(slot, Instance::Inactive) {
            return Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(slot.kind()),
                required: "inactive",
            });
        }
        let broadcast = self.pool.block_on(BroadcastInstance::start(
            id,
            addr,
            send_enabled,
            recv_enabled,
            profile,
            self.pool.handle().clone(),
        ))?;
        *slot = Instance::Broadcast(broadcast);
        Ok(())
    }

    // ---- slot access helpers --------------------------------------------

    fn with_slot<T>(&self, id: usize, f: impl FnOnce(&Instance) -> Result<T>) -> Result<T> {
        let slots = self.slots.read();
        let slot = slots.get(id).ok_or(NetError::InvalidInstance(id))?;
        f(slot)
    }

    fn with_client<T>(&self, id: usize, f: impl FnOnce(&ClientInstance) -> Result<T>) -> Result<T> {
        self.with_slot(id, |slot| match slot {
            Instance::Client(client) => f(client),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "client",
            }),
        })
    }

    fn with_server<T>(&self, id: usize, f: impl FnOnce(&ServerInstance) -> Result<T>) -> Result<T> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => f(server),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server",
            }),
        })
    }

    // ---- connect lifecycle ----------------------------------------------

    /// Status of a client's current or last connect attempt.
    pub fn poll_connect(&self, id: usize) -> ConnectionStatus {
        match self.with_client(id, |client| Ok(client.poll_connect())) {
            Ok(status) => status,
            Err(err) => {
                error::record(err);
                ConnectionStatus::NotConnected
            }
        }
    }

    /// Abort a background connect attempt.
    pub fn stop_connect(&self, id: usize) -> Result<()> {
        self.with_client(id, |client| {
            client.stop_connect();
            Ok(())
        })
    }

    /// Whether a background connect is still running.
    pub fn is_connecting(&self, id: usize) -> bool {
        self.with_client(id, |client| Ok(client.is_connecting()))
            .unwrap_or(false)
    }

    // ---- server polling --------------------------------------------------

    /// Next newly admitted client id, `0` when none.
    pub fn client_joined(&self, id: usize) -> u64 {
        match self.with_server(id, |server| Ok(server.client_joined())) {
            Ok(client) => client,
            Err(err) => {
                error::record(err);
                0
            }
        }
    }

    /// Next departed client id, `0` when none. Consuming the departure
    /// frees the id for reuse.
    pub fn client_left(&self, id: usize) -> u64 {
        match self.with_server(id, |server| Ok(server.client_left())) {
            Ok(client) => client,
            Err(err) => {
                error::record(err);
                0
            }
        }
    }

    /// Connection status of `client` on a server — or of the client
    /// instance itself, in which case `client` is ignored.
    pub fn client_connected(&self, id: usize, client: u64) -> ConnectionStatus {
        let result = self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.client_connected(client)),
            Instance::Client(c) => Ok(c.status()),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        });
        match result {
            Ok(status) => status,
            Err(err) => {
                error::record(err);
                ConnectionStatus::NotConnected
            }
        }
    }

    /// Abortive disconnect; the peer observes a reset.
    pub fn disconnect_client(&self, id: usize, client: u64) -> Result<()> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.disconnect_client(client),
            Instance::Client(c) => {
                c.disconnect();
                Ok(())
            }
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    /// Graceful two-phase disconnect; drains sends, then half-closes.
    pub fn shutdown_client(&self, id: usize, client: u64) -> Result<()> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => self.pool.block_on(server.shutdown_client(client)),
            Instance::Client(c) => self.pool.block_on(c.shutdown()),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    // ---- packet transfer -------------------------------------------------

    fn send_outcome(result: Result<SendStatus>) -> SendStatus {
        match result {
            Ok(status) => status,
            Err(err) => {
                let killed = err.is_fatal_to_connection();
                error::record(err);
                if killed {
                    SendStatus::FailedKill
                } else {
                    SendStatus::Failed
                }
            }
        }
    }

    fn take_payload(packet: &mut Packet) -> Result<()> {
        if packet.poll_cipher() == CipherStatus::Pending {
            return Err(NetError::PacketBusy);
        }
        Ok(())
    }

    /// Send `packet` over the stream — to `client` on a server, to the
    /// server on a client (`client` ignored). `keep = false` clears the
    /// packet once the transport has taken its bytes.
    pub fn send_tcp(
        &self,
        id: usize,
        packet: &mut Packet,
        client: u64,
        keep: bool,
        block: bool,
    ) -> SendStatus {
        let result = Self::take_payload(packet).and_then(|()| {
            self.with_slot(id, |slot| match slot {
                Instance::Server(server) => {
                    self.pool.block_on(server.send_tcp(client, packet.data(), block))
                }
                Instance::Client(c) => self.pool.block_on(c.send_tcp(packet.data(), block)),
                other => Err(NetError::WrongInstanceType {
                    id,
                    actual: kind_str(other.kind()),
                    required: "server or client",
                }),
            })
        });
        let status = Self::send_outcome(result);
        if !keep && matches!(status, SendStatus::Completed | SendStatus::InProgress) {
            packet.clear();
        }
        status
    }

    /// Send `packet` to every connected client except `exclude` (0 = no
    /// exclusion). Per-client failures are logged, not returned.
    pub fn send_all_tcp(
        &self,
        id: usize,
        packet: &mut Packet,
        keep: bool,
        block: bool,
        exclude: u64,
    ) -> SendStatus {
        let result = Self::take_payload(packet).and_then(|()| {
            self.with_server(id, |server| {
                self.pool
                    .block_on(server.send_all_tcp(packet.data(), block, exclude))
            })
        });
        let status = Self::send_outcome(result);
        if !keep && matches!(status, SendStatus::Completed | SendStatus::InProgress) {
            packet.clear();
        }
        status
    }

    /// Send `packet` over the datagram transport, under `operation` when
    /// the demux mode has per-operation queues. On a broadcast instance
    /// both `client` and `operation` are ignored.
    pub fn send_udp(
        &self,
        id: usize,
        packet: &mut Packet,
        client: u64,
        operation: u64,
        keep: bool,
        block: bool,
    ) -> SendStatus {
        let result = Self::take_payload(packet).and_then(|()| {
            self.with_slot(id, |slot| match slot {
                Instance::Server(server) => self
                    .pool
                    .block_on(server.send_udp(client, operation, packet.data(), block)),
                Instance::Client(c) => {
                    self.pool.block_on(c.send_udp(packet.data(), operation, block))
                }
                Instance::Broadcast(b) => self.pool.block_on(b.send(packet.data(), block)),
                Instance::Inactive => Err(NetError::WrongInstanceType {
                    id,
                    actual: "inactive",
                    required: "server, client or broadcast",
                }),
            })
        });
        let status = Self::send_outcome(result);
        if !keep && matches!(status, SendStatus::Completed | SendStatus::InProgress) {
            packet.clear();
        }
        status
    }

    /// Send `packet` verbatim to an explicit address through the
    /// instance's datagram socket (no demux header).
    pub fn send_to_udp(
        &self,
        id: usize,
        packet: &mut Packet,
        target: NetAddress,
        keep: bool,
        block: bool,
    ) -> SendStatus {
        let result = Self::take_payload(packet).and_then(|()| {
            self.with_slot(id, |slot| match slot {
                Instance::Server(server) => self
                    .pool
                    .block_on(server.send_to_udp(packet.data(), target.into(), block)),
                Instance::Client(c) => {
                    self.pool.block_on(c.send_to_udp(packet.data(), target, block))
                }
                Instance::Broadcast(b) => {
                    self.pool.block_on(b.send_to(packet.data(), target, block))
                }
                Instance::Inactive => Err(NetError::WrongInstanceType {
                    id,
                    actual: "inactive",
                    required: "server, client or broadcast",
                }),
            })
        });
        let status = Self::send_outcome(result);
        if !keep && matches!(status, SendStatus::Completed | SendStatus::InProgress) {
            packet.clear();
        }
        status
    }

    /// Datagram sweep over every client with a bound UDP address, except
    /// `exclude`.
    pub fn send_all_udp(
        &self,
        id: usize,
        packet: &mut Packet,
        operation: u64,
        keep: bool,
        block: bool,
        exclude: u64,
    ) -> SendStatus {
        let result = Self::take_payload(packet).and_then(|()| {
            self.with_server(id, |server| {
                self.pool
                    .block_on(server.send_all_udp(operation, packet.data(), block, exclude))
            })
        });
        let status = Self::send_outcome(result);
        if !keep && matches!(status, SendStatus::Completed | SendStatus::InProgress) {
            packet.clear();
        }
        status
    }

    /// Pop the next stream packet from `client` (servers) or from the
    /// server (clients, `client` ignored).
    pub fn recv_tcp(&self, id: usize, client: u64) -> Result<Option<Packet>> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.recv_tcp(client),
            Instance::Client(c) => c.recv_tcp(),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    /// Pop the next datagram routed under (`client`, `operation`);
    /// catch-all modes and broadcast ignore the indices.
    pub fn recv_udp(&self, id: usize, client: usize, operation: usize) -> Result<Option<Packet>> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.recv_udp(client, operation),
            Instance::Client(c) => c.recv_udp(client, operation),
            Instance::Broadcast(b) => b.recv(),
            Instance::Inactive => Err(NetError::WrongInstanceType {
                id,
                actual: "inactive",
                required: "server, client or broadcast",
            }),
        })
    }

    // ---- receive callbacks -----------------------------------------------

    /// Install (or clear) the inline stream receive callback. See
    /// [`RecvCallback`] for the threading contract.
    pub fn set_recv_callback_tcp(
        &self,
        id: usize,
        client: u64,
        callback: Option<RecvCallback>,
    ) -> Result<()> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.set_recv_callback_tcp(client, callback),
            Instance::Client(c) => c.set_recv_callback_tcp(callback),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    /// Install (or clear) the inline datagram receive callback.
    pub fn set_recv_callback_udp(&self, id: usize, callback: Option<RecvCallback>) -> Result<()> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.set_recv_callback_udp(callback),
            Instance::Client(c) => c.set_recv_callback_udp(callback),
            Instance::Broadcast(b) => {
                b.set_recv_callback(callback);
                Ok(())
            }
            Instance::Inactive => Err(NetError::WrongInstanceType {
                id,
                actual: "inactive",
                required: "server, client or broadcast",
            }),
        })
    }

    // ---- introspection ---------------------------------------------------

    /// The handshake-assigned client id of a client instance.
    pub fn client_id(&self, id: usize) -> u64 {
        self.with_client(id, |client| Ok(client.client_id()))
            .unwrap_or(0)
    }

    /// `max_clients` of a server, or the value the server reported to a
    /// client at handshake.
    pub fn max_clients(&self, id: usize) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.max_clients()),
            Instance::Client(c) => Ok(c.max_clients()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Datagram operation count in effect on the instance.
    pub fn num_operations(&self, id: usize) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.profile().num_operations()),
            Instance::Client(c) => Ok(c.num_operations()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Clients currently connected to a server.
    pub fn connected_count(&self, id: usize) -> usize {
        self.with_server(id, |server| Ok(server.connected_count()))
            .unwrap_or(0)
    }

    /// Admission attempts currently in the handshake phase.
    pub fn handshaking_count(&self, id: usize) -> usize {
        self.with_server(id, |server| Ok(server.handshaking_count()))
            .unwrap_or(0)
    }

    /// A copy of the profile the instance was started with.
    pub fn profile(&self, id: usize) -> Result<Profile> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.profile().clone()),
            Instance::Client(c) => Ok(c.profile().clone()),
            Instance::Broadcast(b) => Ok(b.profile().clone()),
            Instance::Inactive => Err(NetError::WrongInstanceType {
                id,
                actual: "inactive",
                required: "any started instance",
            }),
        })
    }

    /// Local stream address (listener for servers).
    pub fn local_tcp_addr(&self, id: usize) -> Result<NetAddress> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(to_net(server.local_tcp_addr())),
            Instance::Client(c) => Ok(to_net(c.local_tcp_addr()?)),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    /// Local datagram address, when the instance has one.
    pub fn local_udp_addr(&self, id: usize) -> Result<NetAddress> {
        self.with_slot(id, |slot| {
            let addr = match slot {
                Instance::Server(server) => server.local_udp_addr()?,
                Instance::Client(c) => c.local_udp_addr()?,
                Instance::Broadcast(b) => Some(b.local_addr()?),
                Instance::Inactive => None,
            };
            addr.map(to_net).ok_or(NetError::NotConnected)
        })
    }

    /// A connected client's stream address as the server sees it.
    pub fn client_tcp_addr(&self, id: usize, client: u64) -> Result<NetAddress> {
        self.with_server(id, |server| Ok(to_net(server.client_tcp_addr(client)?)))
    }

    /// A connected client's verified datagram address, if bound.
    pub fn client_udp_addr(&self, id: usize, client: u64) -> Result<NetAddress> {
        self.with_server(id, |server| {
            server
                .client_udp_addr(client)?
                .map(to_net)
                .ok_or(NetError::NotConnected)
        })
    }

    /// The address a broadcast instance sends to.
    pub fn broadcast_addr(&self, id: usize) -> Result<NetAddress> {
        self.with_slot(id, |slot| match slot {
            Instance::Broadcast(b) => Ok(to_net(b.target())),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "broadcast",
            }),
        })
    }

    /// The server addresses a client instance connected to.
    pub fn server_tcp_addr(&self, id: usize) -> Result<NetAddress> {
        self.with_client(id, |client| Ok(to_net(client.server_tcp_addr()?)))
    }

    pub fn server_udp_addr(&self, id: usize) -> Result<NetAddress> {
        self.with_client(id, |client| {
            client
                .server_udp_addr()?
                .map(to_net)
                .ok_or(NetError::NotConnected)
        })
    }

    /// Reassembly progress of the partial stream message, 0–100.
    pub fn percent_tcp(&self, id: usize, client: u64) -> f64 {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.percent_tcp(client)),
            Instance::Client(c) => Ok(c.percent_tcp()),
            _ => Ok(0.0),
        })
        .unwrap_or(0.0)
    }

    /// Bytes accumulated toward the partial stream message.
    pub fn partial_bytes_tcp(&self, id: usize, client: u64) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.partial_bytes_tcp(client)),
            Instance::Client(c) => Ok(c.partial_bytes_tcp()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Current stream reassembly limit for the connection.
    pub fn recv_limit_tcp(&self, id: usize, client: u64) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.recv_limit_tcp(client)),
            Instance::Client(c) => Ok(c.recv_limit_tcp()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Stream packets waiting in the receive queue.
    pub fn store_amount_tcp(&self, id: usize, client: u64) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.store_amount_tcp(client)),
            Instance::Client(c) => Ok(c.store_amount_tcp()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Datagrams waiting under (`client`, `operation`).
    pub fn store_amount_udp(&self, id: usize, client: usize, operation: usize) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.store_amount_udp(client, operation)),
            Instance::Client(c) => Ok(c.store_amount_udp(client, operation)),
            Instance::Broadcast(b) => Ok(b.store_amount()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Bytes held by the stream receive queue (counts against the cap).
    pub fn queue_bytes_tcp(&self, id: usize, client: u64) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.queue_bytes_tcp(client)),
            Instance::Client(c) => Ok(c.queue_bytes_tcp()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Bytes reserved by in-flight stream sends.
    pub fn send_inflight_tcp(&self, id: usize, client: u64) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.send_inflight_tcp(client)),
            Instance::Client(c) => Ok(c.send_inflight_tcp()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Bytes reserved by in-flight datagram sends.
    pub fn send_inflight_udp(&self, id: usize) -> usize {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => Ok(server.send_inflight_udp()),
            Instance::Client(c) => Ok(c.send_inflight_udp()),
            Instance::Broadcast(b) => Ok(b.send_inflight()),
            _ => Ok(0),
        })
        .unwrap_or(0)
    }

    /// Discard queued stream packets, returning how many were dropped.
    pub fn flush_recv_tcp(&self, id: usize, client: u64) -> Result<usize> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.flush_recv_tcp(client),
            Instance::Client(c) => Ok(c.flush_recv_tcp()),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    /// Discard queued datagrams for `client` (all operations).
    pub fn flush_recv_udp(&self, id: usize, client: usize) -> Result<usize> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.flush_recv_udp(client),
            Instance::Client(c) => Ok(c.flush_recv_udp()),
            Instance::Broadcast(b) => Ok(b.flush_recv()),
            Instance::Inactive => Err(NetError::WrongInstanceType {
                id,
                actual: "inactive",
                required: "server, client or broadcast",
            }),
        })
    }

    // ---- runtime adjustment ----------------------------------------------

    /// Change the handshake timeout for future admissions.
    pub fn set_server_timeout(&self, id: usize, timeout: Duration) -> Result<()> {
        self.with_server(id, |server| {
            server.set_server_timeout(timeout);
            Ok(())
        })
    }

    pub fn server_timeout(&self, id: usize) -> Result<Duration> {
        self.with_server(id, |server| Ok(server.server_timeout()))
    }

    /// Change a connection's stream reassembly limit.
    pub fn change_recv_limit_tcp(&self, id: usize, client: u64, limit: usize) -> Result<()> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.change_recv_limit_tcp(client, limit),
            Instance::Client(c) => c.change_recv_limit_tcp(limit),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }

    /// Change a connection's auto-grow policy.
    pub fn set_auto_grow_tcp(&self, id: usize, client: u64, auto_grow: bool) -> Result<()> {
        self.with_slot(id, |slot| match slot {
            Instance::Server(server) => server.set_auto_grow_tcp(client, auto_grow),
            Instance::Client(c) => c.set_auto_grow_tcp(auto_grow),
            other => Err(NetError::WrongInstanceType {
                id,
                actual: kind_str(other.kind()),
                required: "server or client",
            }),
        })
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.finish_all();
    }
}
