//! # Server Instance
//!
//! Listener, admission table and per-client connections. The accept loop
//! runs one handshake driver per incoming connection, bounded by the
//! server timeout; a peer that completes admission gets the lowest free
//! client id, its stream connection, and (when UDP is on) a trusted
//! datagram address taken from its probe.
//!
//! ## Id lifecycle
//!
//! Ids live in `[1, max_clients]` and are drawn lowest-first from a
//! min-heap. An admitted client surfaces exactly once through
//! [`ServerInstance::client_joined`]; when its connection dies the id is
//! reported once through [`ServerInstance::client_left`] and only then
//! returns to the pool, so an id can never be observed under two owners
//! at once. A client that dies before the application ever saw it join is
//! silently unwound and its id freed immediately.
//!
//! ## Locking
//!
//! The admission tables sit behind one mutex; per-connection state has its
//! own. Lock order is always tables → connection, and the death hook runs
//! without any connection lock held, so the two never invert.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::handshake::{self, RejectReason};
use crate::packet::Packet;
use crate::profile::Profile;
use crate::transport::datagram::{bind_udp, DatagramEndpoint};
use crate::transport::stream::{StreamConnection, StreamTags};
use crate::transport::{ConnectionStatus, RecvCallback, SendStatus};

struct ClientSlot {
    stream: Arc<StreamConnection>,
}

#[derive(Default)]
struct Tables {
    free_ids: BinaryHeap<Reverse<u64>>,
    clients: HashMap<u64, ClientSlot>,
    join_queue: VecDeque<u64>,
    disconnect_queue: VecDeque<u64>,
    handshaking: usize,
}

pub(crate) struct ServerInstance {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    handle: Handle,
    instance_id: usize,
    profile: Profile,
    max_clients: usize,
    local_tcp: SocketAddr,
    udp: Option<Arc<DatagramEndpoint>>,
    tables: Mutex<Tables>,
    probe_waiters: Mutex<HashMap<u64, oneshot::Sender<SocketAddr>>>,
    server_timeout: Mutex<Duration>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInstance {
    /// Bind the listener (and the datagram socket when enabled) and start
    /// accepting.
    pub(crate) async fn start(
        instance_id: usize,
        max_clients: usize,
        profile: Profile,
        handle: Handle,
    ) -> Result<ServerInstance> {
        profile.validate()?;
        if max_clients == 0 {
            return Err(NetError::InvalidProfile(
                "a server needs at least one client slot".into(),
            ));
        }

        let bind_tcp: SocketAddr = if profile.local_tcp().is_unset() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            profile.local_tcp().into()
        };
        let listener = TcpListener::bind(bind_tcp).await?;
        let local_tcp = listener.local_addr()?;

        let udp = if profile.udp_enabled() {
            let bind: SocketAddr = if profile.local_udp().is_unset() {
                // Pair the datagram socket with the listener port when the
                // profile does not say otherwise.
                SocketAddr::new(local_tcp.ip(), local_tcp.port())
            } else {
                profile.local_udp().into()
            };
            let socket = bind_udp(bind, profile.reusable_udp(), false).await?;
            Some(DatagramEndpoint::spawn(
                socket,
                profile.datagram_config(max_clients, true),
                instance_id,
                &handle,
            ))
        } else {
            None
        };

        let mut free_ids = BinaryHeap::with_capacity(max_clients);
        for id in 1..=max_clients as u64 {
            free_ids.push(Reverse(id));
        }

        let shared = Arc::new(ServerShared {
            handle: handle.clone(),
            instance_id,
            server_timeout: Mutex::new(profile.server_timeout()),
            profile,
            max_clients,
            local_tcp,
            udp,
            tables: Mutex::new(Tables {
                free_ids,
                ..Tables::default()
            }),
            probe_waiters: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            probe_task: Mutex::new(None),
        });

        // Route handshake probes from the datagram reader to whichever
        // admission attempt is waiting on them.
        if let Some(udp) = &shared.udp {
            let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
            udp.set_probe_sink(probe_tx);
            let weak = Arc::downgrade(&shared);
            let task = handle.spawn(async move {
                while let Some((client_id, src)) = probe_rx.recv().await {
                    let Some(shared) = weak.upgrade() else { return };
                    if let Some(waiter) = shared.probe_waiters.lock().remove(&client_id) {
                        let _ = waiter.send(src);
                    } else {
                        debug!(client_id, from = %src, "unexpected probe ignored");
                    };
                }
            });
            *shared.probe_task.lock() = Some(task);
        }

        let accept_shared = Arc::clone(&shared);
        let task = handle.spawn(async move { accept_shared.accept_loop(listener).await });
        *shared.accept_task.lock() = Some(task);

        info!(instance = instance_id, addr = %local_tcp, max_clients, "server listening");
        Ok(ServerInstance { shared })
    }

    pub(crate) fn profile(&self) -> &Profile {
        &self.shared.profile
    }

    /// Pop the next newly admitted client id, `0` when none.
    pub(crate) fn client_joined(&self) -> u64 {
        self.shared
            .tables
            .lock()
            .join_queue
            .pop_front()
            .unwrap_or(0)
    }

    /// Pop the next departed client id, `0` when none.
    ///
    /// Consuming the departure is what finally forgets the client: its
    /// slot (and any packets still queued on it) is dropped and the id
    /// returns to the free pool. Queued data from a gracefully departed
    /// client stays drainable until this call reports it.
    pub(crate) fn client_left(&self) -> u64 {
        let mut tables = self.shared.tables.lock();
        match tables.disconnect_queue.pop_front() {
            Some(id) => {
                tables.clients.remove(&id);
                tables.free_ids.push(Reverse(id));
                drop(tables);
                if let Some(udp) = &self.shared.udp {
                    udp.flush_recv(id as usize);
                }
                id
            }
            None => 0,
        }
    }

    /// Connection status of one client.
    pub(crate) fn client_connected(&self, client: u64) -> ConnectionStatus {
        match self.shared.tables.lock().clients.get(&client) {
            Some(slot) => slot.stream.status(),
            None => ConnectionStatus::NotConnected,
        }
    }

    fn client_stream(&self, client: u64) -> Result<Arc<StreamConnection>> {
        self.shared
            .tables
            .lock()
            .clients
            .get(&client)
            .map(|slot| Arc::clone(&slot.stream))
            .ok_or(NetError::InvalidClient(client as usize))
    }

    /// Abortive disconnect: straight to dead, peer observes a reset.
    pub(crate) fn disconnect_client(&self, client: u64) -> Result<()> {
        let stream = self.client_stream(client)?;
        // kill() fires the death hook, which takes the tables lock; it must
        // not already be held here.
        stream.kill();
        Ok(())
    }

    /// Graceful disconnect: drain sends, half-close, wait for the peer's
    /// FIN to finish the exchange.
    pub(crate) async fn shutdown_client(&self, client: u64) -> Result<()> {
        let stream = self.client_stream(client)?;
        stream.shutdown().await
    }

    pub(crate) async fn send_tcp(
        &self,
        client: u64,
        payload: &[u8],
        block: bool,
    ) -> Result<SendStatus> {
        let stream = self.client_stream(client)?;
        stream.send(payload, block).await
    }

    /// Send to every connected client, optionally skipping one. Individual
    /// failures are logged, never abort the sweep.
    pub(crate) async fn send_all_tcp(
        &self,
        payload: &[u8],
        block: bool,
        exclude: u64,
    ) -> Result<SendStatus> {
        let streams: Vec<(u64, Arc<StreamConnection>)> = self
            .shared
            .tables
            .lock()
            .clients
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(id, slot)| (*id, Arc::clone(&slot.stream)))
            .collect();
        for (id, stream) in streams {
            if let Err(err) = stream.send(payload, block).await {
                warn!(client = id, %err, "broadcast stream send failed");
            }
        }
        Ok(if block {
            SendStatus::Completed
        } else {
            SendStatus::InProgress
        })
    }

    pub(crate) fn recv_tcp(&self, client: u64) -> Result<Option<Packet>> {
        Ok(self.client_stream(client)?.recv())
    }

    fn endpoint(&self) -> Result<Arc<DatagramEndpoint>> {
        self.shared
            .udp
            .as_ref()
            .cloned()
            .ok_or(NetError::NotConnected)
    }

    pub(crate) async fn send_udp(
        &self,
        client: u64,
        operation: u64,
        payload: &[u8],
        block: bool,
    ) -> Result<SendStatus> {
        let udp = self.endpoint()?;
        let target = udp
            .client_addr(client)
            .ok_or(NetError::InvalidClient(client as usize))?;
        udp.send(payload, client, operation, Some(target), block).await
    }

    pub(crate) async fn send_all_udp(
        &self,
        operation: u64,
        payload: &[u8],
        block: bool,
        exclude: u64,
    ) -> Result<SendStatus> {
        let udp = self.endpoint()?;
        let clients: Vec<u64> = self
            .shared
            .tables
            .lock()
            .clients
            .keys()
            .copied()
            .filter(|id| *id != exclude)
            .collect();
        for id in clients {
            let Some(target) = udp.client_addr(id) else {
                continue;
            };
            if let Err(err) = udp.send(payload, id, operation, Some(target), block).await {
                warn!(client = id, %err, "broadcast datagram send failed");
            }
        }
        Ok(if block {
            SendStatus::Completed
        } else {
            SendStatus::InProgress
        })
    }

    /// Send raw bytes to an arbitrary address through the server's socket.
    pub(crate) async fn send_to_udp(
        &self,
        payload: &[u8],
        target: SocketAddr,
        block: bool,
    ) -> Result<SendStatus> {
        let udp = self.endpoint()?;
        udp.send_raw(payload.to_vec(), Some(target), block).await
    }

    pub(crate) fn recv_udp(&self, client: usize, operation: usize) -> Result<Option<Packet>> {
        self.endpoint()?.recv(client, operation)
    }

    // ---- runtime adjustment ---------------------------------------------

    /// Handshake timeout applied to attempts that start after the change.
    pub(crate) fn set_server_timeout(&self, timeout: Duration) {
        *self.shared.server_timeout.lock() = timeout;
    }

    pub(crate) fn server_timeout(&self) -> Duration {
        *self.shared.server_timeout.lock()
    }

    pub(crate) fn change_recv_limit_tcp(&self, client: u64, limit: usize) -> Result<()> {
        self.client_stream(client)?.set_recv_limit(limit);
        Ok(())
    }

    pub(crate) fn set_auto_grow_tcp(&self, client: u64, auto_grow: bool) -> Result<()> {
        self.client_stream(client)?.set_auto_grow(auto_grow);
        Ok(())
    }

    pub(crate) fn set_recv_callback_tcp(
        &self,
        client: u64,
        callback: Option<RecvCallback>,
    ) -> Result<()> {
        self.client_stream(client)?.set_recv_callback(callback);
        Ok(())
    }

    pub(crate) fn set_recv_callback_udp(&self, callback: Option<RecvCallback>) -> Result<()> {
        self.endpoint()?.set_recv_callback(callback);
        Ok(())
    }

    // ---- introspection --------------------------------------------------

    pub(crate) fn max_clients(&self) -> usize {
        self.shared.max_clients
    }

    pub(crate) fn connected_count(&self) -> usize {
        self.shared.tables.lock().clients.len()
    }

    pub(crate) fn handshaking_count(&self) -> usize {
        self.shared.tables.lock().handshaking
    }

    pub(crate) fn local_tcp_addr(&self) -> SocketAddr {
        self.shared.local_tcp
    }

    pub(crate) fn local_udp_addr(&self) -> Result<Option<SocketAddr>> {
        match &self.shared.udp {
            Some(udp) => Ok(Some(udp.local_addr()?)),
            None => Ok(None),
        }
    }

    pub(crate) fn client_tcp_addr(&self, client: u64) -> Result<SocketAddr> {
        self.shared
            .tables
            .lock()
            .clients
            .get(&client)
            .map(|slot| slot.stream.peer_addr())
            .ok_or(NetError::InvalidClient(client as usize))
    }

    pub(crate) fn client_udp_addr(&self, client: u64) -> Result<Option<SocketAddr>> {
        // Distinguish "no such client" from "client has no UDP binding".
        self.client_stream(client)?;
        Ok(self.shared.udp.as_ref().and_then(|udp| udp.client_addr(client)))
    }

    pub(crate) fn percent_tcp(&self, client: u64) -> f64 {
        self.client_stream(client)
            .map(|s| s.percent())
            .unwrap_or(0.0)
    }

    pub(crate) fn partial_bytes_tcp(&self, client: u64) -> usize {
        self.client_stream(client)
            .map(|s| s.partial_bytes())
            .unwrap_or(0)
    }

    pub(crate) fn recv_limit_tcp(&self, client: u64) -> usize {
        self.client_stream(client)
            .map(|s| s.recv_limit())
            .unwrap_or(0)
    }

    pub(crate) fn store_amount_tcp(&self, client: u64) -> usize {
        self.client_stream(client)
            .map(|s| s.queue_len())
            .unwrap_or(0)
    }

    pub(crate) fn queue_bytes_tcp(&self, client: u64) -> usize {
        self.client_stream(client)
            .map(|s| s.queue_bytes())
            .unwrap_or(0)
    }

    pub(crate) fn store_amount_udp(&self, client: usize, operation: usize) -> usize {
        self.shared
            .udp
            .as_ref()
            .map(|udp| udp.queue_len(client, operation))
            .unwrap_or(0)
    }

    pub(crate) fn send_inflight_tcp(&self, client: u64) -> usize {
        self.client_stream(client)
            .map(|s| s.send_inflight())
            .unwrap_or(0)
    }

    pub(crate) fn send_inflight_udp(&self) -> usize {
        self.shared
            .udp
            .as_ref()
            .map(|udp| udp.send_inflight())
            .unwrap_or(0)
    }

    pub(crate) fn flush_recv_tcp(&self, client: u64) -> Result<usize> {
        Ok(self.client_stream(client)?.flush_recv())
    }

    pub(crate) fn flush_recv_udp(&self, client: usize) -> Result<usize> {
        Ok(self.endpoint()?.flush_recv(client))
    }

    /// Kill every connection and stop accepting. Connections are dead when
    /// this returns; the registry drops the instance afterwards.
    pub(crate) async fn finish(&self) {
        if let Some(task) = self.shared.accept_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.shared.probe_task.lock().take() {
            task.abort();
        }
        let streams: Vec<Arc<StreamConnection>> = self
            .shared
            .tables
            .lock()
            .clients
            .values()
            .map(|slot| Arc::clone(&slot.stream))
            .collect();
        for stream in streams {
            stream.kill();
            stream.wait_closed().await;
        }
        if let Some(udp) = &self.shared.udp {
            udp.close();
        }
        debug!(instance = self.shared.instance_id, "server finished");
    }
}

impl ServerShared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(instance = self.instance_id, %peer, "incoming connection");
                    let shared = Arc::clone(&self);
                    self.handle
                        .spawn(async move { shared.admit(stream, peer).await });
                }
                Err(err) => {
                    warn!(instance = self.instance_id, %err, "accept failed");
                    // Brief pause so a persistent error (fd exhaustion)
                    // cannot spin the loop hot.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn draw_client_id(&self) -> Option<u64> {
        let mut tables = self.tables.lock();
        match tables.free_ids.pop() {
            Some(Reverse(id)) => {
                tables.handshaking += 1;
                Some(id)
            }
            None => None,
        }
    }

    async fn admit(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let timeout = *self.server_timeout.lock();

        // Draw the lowest free id.
        let client_id = match self.draw_client_id() {
            Some(id) => id,
            None => {
                info!(instance = self.instance_id, %peer, "server full, rejecting");
                let _ = tokio::time::timeout(
                    timeout,
                    handshake::reject(&mut stream, RejectReason::Full),
                )
                .await;
                return;
            }
        };

        let admitted = if self.profile.handshake_enabled() {
            self.run_handshake(&mut stream, client_id, timeout).await
        } else {
            Ok(None)
        };

        let mut tables = self.tables.lock();
        tables.handshaking -= 1;
        match admitted {
            Ok(udp_addr) => {
                let config = self.profile.stream_config();
                let tags = StreamTags {
                    client: client_id as usize,
                    instance: self.instance_id,
                };
                match StreamConnection::spawn(stream, config, tags, &self.handle) {
                    Ok(conn) => {
                        let weak = Arc::downgrade(&self);
                        let id = client_id;
                        conn.set_on_closed(Box::new(move || {
                            if let Some(shared) = weak.upgrade() {
                                shared.on_client_closed(id);
                            }
                        }));
                        if let (Some(udp), Some(addr)) = (&self.udp, udp_addr) {
                            udp.register_client(client_id, addr);
                        }
                        tables.clients.insert(client_id, ClientSlot { stream: conn });
                        tables.join_queue.push_back(client_id);
                        info!(
                            instance = self.instance_id,
                            client_id,
                            %peer,
                            "client admitted"
                        );
                        // The connection may have ended before the hook
                        // was installed; unwind it here in that case
                        // (on_client_closed tolerates running twice).
                        let closed_early = tables.clients[&client_id].stream.is_closed();
                        drop(tables);
                        if closed_early {
                            self.on_client_closed(client_id);
                        }
                        return;
                    }
                    Err(err) => {
                        warn!(instance = self.instance_id, %peer, %err, "post-handshake setup failed");
                        tables.free_ids.push(Reverse(client_id));
                    }
                }
            }
            Err(err) => {
                debug!(instance = self.instance_id, %peer, %err, "handshake failed");
                tables.free_ids.push(Reverse(client_id));
            }
        }
    }

    /// Run the admission exchange under the handshake timeout.
    async fn run_handshake(
        &self,
        stream: &mut TcpStream,
        client_id: u64,
        timeout: Duration,
    ) -> Result<Option<SocketAddr>> {
        let udp_enabled = self.udp.is_some();
        let (probe_tx, probe_rx) = oneshot::channel();
        if udp_enabled {
            self.probe_waiters.lock().insert(client_id, probe_tx);
        }
        let result = tokio::time::timeout(
            timeout,
            handshake::server_handshake(
                stream,
                client_id,
                self.max_clients,
                self.profile.num_operations(),
                udp_enabled,
                async { probe_rx.await.ok() },
            ),
        )
        .await;
        self.probe_waiters.lock().remove(&client_id);
        match result {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(NetError::HandshakeTimeout),
        }
    }

    /// Teardown hook: runs when a connection ends, outside any connection
    /// lock. Tolerates running twice for the same client.
    ///
    /// The slot is kept until the departure is consumed so packets already
    /// queued from the peer stay drainable; only a client the application
    /// never saw join is unwound on the spot.
    fn on_client_closed(&self, client_id: u64) {
        let mut tables = self.tables.lock();
        if !tables.clients.contains_key(&client_id) {
            return;
        }
        if let Some(pos) = tables.join_queue.iter().position(|id| *id == client_id) {
            // Never observed by the application; unwind silently.
            tables.join_queue.remove(pos);
            tables.clients.remove(&client_id);
            tables.free_ids.push(Reverse(client_id));
        } else if !tables.disconnect_queue.contains(&client_id) {
            tables.disconnect_queue.push_back(client_id);
        }
        drop(tables);
        if let Some(udp) = &self.udp {
            udp.unregister_client(client_id);
        }
        debug!(instance = self.instance_id, client_id, "client connection ended");
    }
}
