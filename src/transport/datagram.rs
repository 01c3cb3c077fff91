//! # Datagram Endpoint
//!
//! One [`DatagramEndpoint`] wraps one UDP socket and demultiplexes every
//! datagram it receives according to the configured mode:
//!
//! - [`DatagramMode::CatchAll`] — the body is delivered verbatim to the
//!   instance-wide queue, `client_from = 0`. Broadcast and raw-UDP interop.
//! - [`DatagramMode::CatchAllNo`] — as above, but when a decrypt key is
//!   configured the body is decrypted in place first; datagrams that are
//!   not block-aligned are dropped silently.
//! - [`DatagramMode::PerClient`] — `u64 client_id || payload`, one queue
//!   per client.
//! - [`DatagramMode::PerClientPerOperation`] — `u64 client_id ||
//!   u64 operation_id || payload`, one queue per (client, operation).
//!
//! Per-client modes never trust the declared id alone: when source
//! verification is on (servers), the datagram's source address must match
//! the address recorded at handshake completion, otherwise the datagram is
//! dropped. Header integers are 8-byte little-endian, like every
//! size-typed integer in this library.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PacketQueue, RecvCallback, SendLedger, SendStatus};
use crate::crypto::{self, CipherKey, BLOCK_SIZE};
use crate::error::{NetError, Result};
use crate::handshake::{PROBE_LEN, PROBE_MAGIC};
use crate::packet::Packet;
use crate::recycle::MemoryRecycle;

/// Bind a UDP socket with the options the profiles care about. Must run
/// inside the worker runtime so the socket registers with its reactor.
pub(crate) async fn bind_udp(
    local: SocketAddr,
    reuse: bool,
    broadcast: bool,
) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// How received datagrams are tagged and routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatagramMode {
    /// Everything lands in one instance-wide queue.
    #[default]
    CatchAll,
    /// Catch-all with optional in-place decryption.
    CatchAllNo,
    /// One queue per client, demuxed by a `u64` id header.
    PerClient,
    /// One queue per (client, operation) pair.
    PerClientPerOperation,
}

impl DatagramMode {
    /// Bytes of demux header preceding the payload.
    pub fn header_len(&self) -> usize {
        match self {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => 0,
            DatagramMode::PerClient => 8,
            DatagramMode::PerClientPerOperation => 16,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DatagramConfig {
    pub mode: DatagramMode,
    pub num_operations: usize,
    /// Highest client id that can appear in a demux header.
    pub max_clients: usize,
    pub recv_buffer: usize,
    pub recv_cap: usize,
    pub send_cap: usize,
    pub send_timeout: Duration,
    pub decrypt_key: Option<CipherKey>,
    pub recycle_depth: usize,
    /// Require the source address of per-client datagrams to match the
    /// registered one. On for servers, off for clients (whose socket is
    /// connected to the server anyway).
    pub verify_source: bool,
}

pub(crate) struct DatagramEndpoint {
    // Set at construction; lets `&self` methods hand an owning reference
    // to spawned tasks.
    self_weak: Weak<DatagramEndpoint>,
    handle: Handle,
    socket: Arc<UdpSocket>,
    config: DatagramConfig,
    instance: usize,
    send_ledger: SendLedger,
    catch_all: PacketQueue,
    // Indexed [client_id][operation]; id 0 is the server slot.
    per_client: Vec<Vec<PacketQueue>>,
    trusted: RwLock<HashMap<u64, SocketAddr>>,
    probe_sink: Mutex<Option<mpsc::UnboundedSender<(u64, SocketAddr)>>>,
    recv_callback: Mutex<Option<RecvCallback>>,
    recycle: Mutex<MemoryRecycle>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    dead: AtomicBool,
}

impl DatagramEndpoint {
    /// Take ownership of a bound (and possibly connected) socket and start
    /// the demultiplexing reader task.
    pub(crate) fn spawn(
        socket: UdpSocket,
        config: DatagramConfig,
        instance: usize,
        handle: &Handle,
    ) -> Arc<DatagramEndpoint> {
        let queues_per_client = config.num_operations.max(1);
        let clients = match config.mode {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => 0,
            _ => config.max_clients + 1,
        };
        let per_client = (0..clients)
            .map(|_| {
                (0..queues_per_client)
                    .map(|_| PacketQueue::new(config.recv_cap))
                    .collect()
            })
            .collect();

        let endpoint = Arc::new_cyclic(|weak| DatagramEndpoint {
            self_weak: weak.clone(),
            handle: handle.clone(),
            socket: Arc::new(socket),
            send_ledger: SendLedger::new(config.send_cap),
            catch_all: PacketQueue::new(config.recv_cap),
            per_client,
            trusted: RwLock::new(HashMap::new()),
            probe_sink: Mutex::new(None),
            recv_callback: Mutex::new(None),
            recycle: Mutex::new(MemoryRecycle::new(config.recycle_depth, config.recv_buffer)),
            reader_task: Mutex::new(None),
            dead: AtomicBool::new(false),
            config,
            instance,
        });

        let reader = Arc::clone(&endpoint);
        let task = handle.spawn(async move { reader.read_loop().await });
        *endpoint.reader_task.lock() = Some(task);
        endpoint
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.recv_buffer.max(PROBE_LEN)];
        loop {
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            match self.socket.recv_from(&mut buf).await {
                Ok((n, src)) => self.dispatch(&buf[..n], src),
                Err(err) => {
                    if self.dead.load(Ordering::Acquire) {
                        return;
                    }
                    // UDP read errors are transient (e.g. ICMP port
                    // unreachable bounced back); keep the endpoint alive.
                    debug!(%err, "datagram read error ignored");
                }
            }
        }
    }

    fn dispatch(&self, data: &[u8], src: SocketAddr) {
        // Handshake probes are routed to the admission machinery before any
        // mode-specific handling.
        if data.len() == PROBE_LEN {
            let magic = u32::from_le_bytes(data[..4].try_into().unwrap());
            if magic == PROBE_MAGIC {
                if let Some(sink) = self.probe_sink.lock().as_ref() {
                    let client_id = u64::from_le_bytes(data[4..12].try_into().unwrap());
                    let _ = sink.send((client_id, src));
                    return;
                }
            }
        }

        match self.config.mode {
            DatagramMode::CatchAll => self.deliver(data.to_vec(), 0, 0),
            DatagramMode::CatchAllNo => {
                let mut body = data.to_vec();
                if let Some(key) = &self.config.decrypt_key {
                    if body.is_empty() || body.len() % BLOCK_SIZE != 0 {
                        debug!(len = body.len(), "undecryptable datagram dropped");
                        return;
                    }
                    crypto::decrypt_in_place(key, &mut body);
                }
                self.deliver(body, 0, 0);
            }
            DatagramMode::PerClient => {
                let Some((client, payload)) = self.demux_client(data, src) else {
                    return;
                };
                self.deliver(payload.to_vec(), client, 0);
            }
            DatagramMode::PerClientPerOperation => {
                let Some((client, rest)) = self.demux_client(data, src) else {
                    return;
                };
                if rest.len() < 8 {
                    debug!(from = %src, "short per-operation datagram dropped");
                    return;
                }
                let operation = u64::from_le_bytes(rest[..8].try_into().unwrap()) as usize;
                if operation >= self.config.num_operations.max(1) {
                    warn!(
                        from = %src,
                        operation,
                        limit = self.config.num_operations,
                        "datagram names an unknown operation, dropped"
                    );
                    return;
                }
                self.deliver(rest[8..].to_vec(), client, operation);
            }
        }
    }

    /// Parse and authenticate the client-id header of a per-client datagram.
    fn demux_client<'a>(&self, data: &'a [u8], src: SocketAddr) -> Option<(usize, &'a [u8])> {
        if data.len() < 8 {
            debug!(from = %src, "short per-client datagram dropped");
            return None;
        }
        let client_id = u64::from_le_bytes(data[..8].try_into().unwrap());
        if client_id as usize >= self.per_client.len() {
            debug!(from = %src, client_id, "datagram names an unknown client, dropped");
            return None;
        }
        if self.config.verify_source {
            match self.trusted.read().get(&client_id) {
                Some(addr) if *addr == src => {}
                _ => {
                    warn!(
                        from = %src,
                        client_id,
                        "datagram source does not match the handshake address, dropped"
                    );
                    return None;
                }
            }
        }
        Some((client_id as usize, &data[8..]))
    }

    fn deliver(&self, body: Vec<u8>, client: usize, operation: usize) {
        let mut packet = self.recycle.lock().acquire();
        packet.clear();
        if packet.add_str(&body, false).is_err() {
            return;
        }
        let _ = packet.set_cursor(0);
        packet.tag_received(client, operation, self.instance);

        let callback = self.recv_callback.lock().clone();
        if let Some(callback) = callback {
            callback(packet);
            return;
        }
        let queue = self.queue_for(client, operation);
        if queue.can_accept(packet.used_size()) {
            let _ = queue.push(packet);
        } else {
            warn!(
                client,
                operation,
                queued = queue.bytes(),
                cap = queue.cap(),
                "receive queue full, datagram dropped"
            );
            queue.note_drop();
            self.recycle.lock().release(packet);
        }
    }

    fn queue_for(&self, client: usize, operation: usize) -> &PacketQueue {
        match self.config.mode {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => &self.catch_all,
            _ => &self.per_client[client][operation.min(self.config.num_operations.max(1) - 1)],
        }
    }

    /// Pop the next datagram routed under (`client`, `operation`).
    /// Catch-all modes ignore both indices.
    pub(crate) fn recv(&self, client: usize, operation: usize) -> Result<Option<Packet>> {
        match self.config.mode {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => Ok(self.catch_all.pop()),
            _ => {
                if client >= self.per_client.len() {
                    return Err(NetError::InvalidClient(client));
                }
                if operation >= self.config.num_operations.max(1) {
                    return Err(NetError::InvalidOperation {
                        id: operation,
                        num_operations: self.config.num_operations,
                    });
                }
                Ok(self.per_client[client][operation].pop())
            }
        }
    }

    /// Send `payload` with this mode's demux header prepended.
    ///
    /// `target` is required when the socket is not connected (servers,
    /// broadcast); connected sockets (clients) pass `None`.
    pub(crate) async fn send(
        &self,
        payload: &[u8],
        client: u64,
        operation: u64,
        target: Option<SocketAddr>,
        block: bool,
    ) -> Result<SendStatus> {
        let mut wire = Vec::with_capacity(self.config.mode.header_len() + payload.len());
        match self.config.mode {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => {}
            DatagramMode::PerClient => wire.extend_from_slice(&client.to_le_bytes()),
            DatagramMode::PerClientPerOperation => {
                if operation as usize >= self.config.num_operations.max(1) {
                    return Err(NetError::InvalidOperation {
                        id: operation as usize,
                        num_operations: self.config.num_operations,
                    });
                }
                wire.extend_from_slice(&client.to_le_bytes());
                wire.extend_from_slice(&operation.to_le_bytes());
            }
        }
        wire.extend_from_slice(payload);
        self.send_raw(wire, target, block).await
    }

    /// Send pre-composed bytes verbatim (no demux header). Backs the
    /// send-to-address interop path and the handshake probe.
    pub(crate) async fn send_raw(
        &self,
        wire: Vec<u8>,
        target: Option<SocketAddr>,
        block: bool,
    ) -> Result<SendStatus> {
        if self.dead.load(Ordering::Acquire) {
            return Err(NetError::NotConnected);
        }
        self.send_ledger.reserve(wire.len())?;
        if block {
            self.write_wire(wire, target).await
        } else {
            let endpoint = self
                .self_weak
                .upgrade()
                .expect("caller holds a strong reference");
            self.handle.spawn(async move {
                if let Err(err) = endpoint.write_wire(wire, target).await {
                    debug!(%err, "background datagram send failed");
                }
            });
            Ok(SendStatus::InProgress)
        }
    }

    async fn write_wire(&self, wire: Vec<u8>, target: Option<SocketAddr>) -> Result<SendStatus> {
        let result = tokio::time::timeout(self.config.send_timeout, async {
            match target {
                Some(addr) => self.socket.send_to(&wire, addr).await,
                None => self.socket.send(&wire).await,
            }
        })
        .await;
        self.send_ledger.release(wire.len());
        match result {
            Ok(Ok(_)) => Ok(SendStatus::Completed),
            Ok(Err(err)) => Err(NetError::Transport(err)),
            Err(_elapsed) => Err(NetError::SendTimeout),
        }
    }

    // ---- admission plumbing ---------------------------------------------

    /// Route handshake probes to `sink` instead of the demultiplexer.
    pub(crate) fn set_probe_sink(&self, sink: mpsc::UnboundedSender<(u64, SocketAddr)>) {
        *self.probe_sink.lock() = Some(sink);
    }

    /// Record the verified source address for `client`.
    pub(crate) fn register_client(&self, client: u64, addr: SocketAddr) {
        self.trusted.write().insert(client, addr);
    }

    /// Stop trusting a departed client's address. Already-queued datagrams
    /// stay deliverable; [`DatagramEndpoint::flush_recv`] drops them.
    pub(crate) fn unregister_client(&self, client: u64) {
        self.trusted.write().remove(&client);
    }

    /// The registered source address for `client`, if any.
    pub(crate) fn client_addr(&self, client: u64) -> Option<SocketAddr> {
        self.trusted.read().get(&client).copied()
    }

    pub(crate) fn set_recv_callback(&self, callback: Option<RecvCallback>) {
        *self.recv_callback.lock() = callback;
    }

    /// Stop the reader and refuse further sends.
    pub(crate) fn close(&self) {
        self.dead.store(true, Ordering::Release);
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }

    // ---- introspection --------------------------------------------------

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub(crate) fn send_inflight(&self) -> usize {
        self.send_ledger.inflight()
    }

    /// Queued packets for (`client`, `operation`); catch-all modes ignore
    /// the indices.
    pub(crate) fn queue_len(&self, client: usize, operation: usize) -> usize {
        match self.config.mode {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => self.catch_all.len(),
            _ => self
                .per_client
                .get(client)
                .and_then(|ops| ops.get(operation))
                .map(PacketQueue::len)
                .unwrap_or(0),
        }
    }

    /// Drop everything queued for `client`, all operations.
    pub(crate) fn flush_recv(&self, client: usize) -> usize {
        match self.config.mode {
            DatagramMode::CatchAll | DatagramMode::CatchAllNo => self.catch_all.flush(),
            _ => self
                .per_client
                .get(client)
                .map(|ops| ops.iter().map(PacketQueue::flush).sum())
                .unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for DatagramEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramEndpoint")
            .field("mode", &self.config.mode)
            .field("instance", &self.instance)
            .finish()
    }
}
