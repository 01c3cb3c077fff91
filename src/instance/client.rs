//! # Client Instance
//!
//! One outgoing connection: a stream to the server, an optional datagram
//! endpoint, and the connect-and-handshake driver. Connecting can block
//! the caller or run in the background and be observed with
//! [`ClientInstance::poll_connect`].

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::addr::NetAddress;
use crate::error::{NetError, Result};
use crate::handshake::{self, Admission};
use crate::packet::Packet;
use crate::profile::Profile;
use crate::transport::datagram::{bind_udp, DatagramEndpoint};
use crate::transport::stream::{StreamConnection, StreamTags};
use crate::transport::{ConnectionStatus, RecvCallback, SendStatus};

enum ClientState {
    Idle,
    Connecting,
    /// Failed connect attempt; sticky until the next `connect`.
    Failed(ConnectionStatus),
    Connected(Box<Link>),
}

/// Everything a successful connect produces.
struct Link {
    stream: Arc<StreamConnection>,
    udp: Option<Arc<DatagramEndpoint>>,
    client_id: u64,
    max_clients: usize,
    num_operations: usize,
    server_tcp: SocketAddr,
    server_udp: Option<SocketAddr>,
}

pub(crate) struct ClientInstance {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    handle: Handle,
    instance_id: usize,
    profile: Profile,
    state: Mutex<ClientState>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInstance {
    pub(crate) fn new(instance_id: usize, profile: Profile, handle: Handle) -> Result<ClientInstance> {
        profile.validate()?;
        Ok(ClientInstance {
            shared: Arc::new(ClientShared {
                handle,
                instance_id,
                profile,
                state: Mutex::new(ClientState::Idle),
                connect_task: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn profile(&self) -> &Profile {
        &self.shared.profile
    }

    /// Connect to `tcp` (and `udp` when the profile enables it) within
    /// `timeout`.
    ///
    /// Blocking waits for the whole connect + handshake and returns the
    /// final status. Non-blocking returns `StillConnecting` immediately;
    /// progress is observed through [`ClientInstance::poll_connect`].
    pub(crate) async fn connect(
        &self,
        tcp: NetAddress,
        udp: Option<NetAddress>,
        timeout: Duration,
        block: bool,
    ) -> Result<ConnectionStatus> {
        {
            let mut state = self.shared.state.lock();
            match &*state {
                ClientState::Connecting => return Err(NetError::AlreadyConnecting),
                ClientState::Connected(link) if !link.stream.is_dead() => {
                    return Err(NetError::AlreadyConnecting)
                }
                _ => *state = ClientState::Connecting,
            }
        }

        let shared = Arc::clone(&self.shared);
        let tcp: SocketAddr = tcp.into();
        let udp: Option<SocketAddr> = udp.map(Into::into);
        if block {
            ClientShared::drive_connect(shared, tcp, udp, timeout).await;
            Ok(self.poll_connect())
        } else {
            let task = self
                .shared
                .handle
                .spawn(async move { ClientShared::drive_connect(shared, tcp, udp, timeout).await });
            *self.shared.connect_task.lock() = Some(task);
            Ok(ConnectionStatus::StillConnecting)
        }
    }

    /// Status of the current or last connect attempt.
    pub(crate) fn poll_connect(&self) -> ConnectionStatus {
        match &*self.shared.state.lock() {
            ClientState::Idle => ConnectionStatus::NotConnected,
            ClientState::Connecting => ConnectionStatus::StillConnecting,
            ClientState::Failed(status) => *status,
            ClientState::Connected(link) => link.stream.status(),
        }
    }

    /// Abort a background connect attempt.
    pub(crate) fn stop_connect(&self) {
        let task = self.shared.connect_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let mut state = self.shared.state.lock();
        if matches!(*state, ClientState::Connecting) {
            *state = ClientState::Idle;
            debug!(instance = self.shared.instance_id, "connect attempt aborted");
        }
    }

    /// Whether a background connect is still running.
    pub(crate) fn is_connecting(&self) -> bool {
        matches!(*self.shared.state.lock(), ClientState::Connecting)
    }

    fn link<T>(&self, f: impl FnOnce(&Link) -> T) -> Result<T> {
        match &*self.shared.state.lock() {
            ClientState::Connected(link) => Ok(f(link)),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Connection state as the application observes it.
    pub(crate) fn status(&self) -> ConnectionStatus {
        self.poll_connect()
    }

    /// The handshake-assigned id, `0` when none was assigned.
    pub(crate) fn client_id(&self) -> u64 {
        self.link(|l| l.client_id).unwrap_or(0)
    }

    /// `max_clients` reported by the server at handshake.
    pub(crate) fn max_clients(&self) -> usize {
        self.link(|l| l.max_clients).unwrap_or(0)
    }

    /// `num_operations` reported by the server at handshake.
    pub(crate) fn num_operations(&self) -> usize {
        self.link(|l| l.num_operations).unwrap_or(0)
    }

    pub(crate) async fn send_tcp(&self, payload: &[u8], block: bool) -> Result<SendStatus> {
        let stream = self.link(|l| Arc::clone(&l.stream))?;
        stream.send(payload, block).await
    }

    pub(crate) fn recv_tcp(&self) -> Result<Option<Packet>> {
        self.link(|l| l.stream.recv())
    }

    /// Send a datagram to the server, headed with this client's own id as
    /// the demux mode requires.
    pub(crate) async fn send_udp(
        &self,
        payload: &[u8],
        operation: u64,
        block: bool,
    ) -> Result<SendStatus> {
        let (udp, id) = self.link(|l| (l.udp.clone(), l.client_id))?;
        let udp = udp.ok_or(NetError::NotConnected)?;
        udp.send(payload, id, operation, None, block).await
    }

    /// Send raw bytes to an arbitrary address through the client's socket.
    pub(crate) async fn send_to_udp(
        &self,
        payload: &[u8],
        target: NetAddress,
        block: bool,
    ) -> Result<SendStatus> {
        let udp = self
            .link(|l| l.udp.clone())?
            .ok_or(NetError::NotConnected)?;
        udp.send_raw(payload.to_vec(), Some(target.into()), block).await
    }

    pub(crate) fn recv_udp(&self, client: usize, operation: usize) -> Result<Option<Packet>> {
        let udp = self
            .link(|l| l.udp.clone())?
            .ok_or(NetError::NotConnected)?;
        udp.recv(client, operation)
    }

    /// Graceful half-close toward the server.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let stream = self.link(|l| Arc::clone(&l.stream))?;
        stream.shutdown().await
    }

    /// Abortive teardown of everything the instance holds.
    pub(crate) fn disconnect(&self) {
        self.stop_connect();
        let mut state = self.shared.state.lock();
        if let ClientState::Connected(link) = &*state {
            link.stream.kill();
            if let Some(udp) = &link.udp {
                udp.close();
            }
        }
        *state = ClientState::Idle;
    }

    pub(crate) fn set_recv_callback_tcp(&self, callback: Option<RecvCallback>) -> Result<()> {
        self.link(|l| l.stream.set_recv_callback(callback))
    }

    pub(crate) fn set_recv_callback_udp(&self, callback: Option<RecvCallback>) -> Result<()> {
        let udp = self
            .link(|l| l.udp.clone())?
            .ok_or(NetError::NotConnected)?;
        udp.set_recv_callback(callback);
        Ok(())
    }

    // ---- introspection --------------------------------------------------

    pub(crate) fn server_tcp_addr(&self) -> Result<SocketAddr> {
        self.link(|l| l.server_tcp)
    }

    pub(crate) fn server_udp_addr(&self) -> Result<Option<SocketAddr>> {
        self.link(|l| l.server_udp)
    }

    pub(crate) fn local_tcp_addr(&self) -> Result<SocketAddr> {
        self.link(|l| l.stream.local_addr())
    }

    pub(crate) fn local_udp_addr(&self) -> Result<Option<SocketAddr>> {
        let udp = self.link(|l| l.udp.clone())?;
        match udp {
            Some(udp) => Ok(Some(udp.local_addr()?)),
            None => Ok(None),
        }
    }

    pub(crate) fn percent_tcp(&self) -> f64 {
        self.link(|l| l.stream.percent()).unwrap_or(0.0)
    }

    pub(crate) fn partial_bytes_tcp(&self) -> usize {
        self.link(|l| l.stream.partial_bytes()).unwrap_or(0)
    }

    pub(crate) fn recv_limit_tcp(&self) -> usize {
        self.link(|l| l.stream.recv_limit()).unwrap_or(0)
    }

    pub(crate) fn store_amount_tcp(&self) -> usize {
        self.link(|l| l.stream.queue_len()).unwrap_or(0)
    }

    pub(crate) fn queue_bytes_tcp(&self) -> usize {
        self.link(|l| l.stream.queue_bytes()).unwrap_or(0)
    }

    pub(crate) fn store_amount_udp(&self, client: usize, operation: usize) -> usize {
        self.link(|l| {
            l.udp
                .as_ref()
                .map(|u| u.queue_len(client, operation))
                .unwrap_or(0)
        })
        .unwrap_or(0)
    }

    pub(crate) fn send_inflight_tcp(&self) -> usize {
        self.link(|l| l.stream.send_inflight()).unwrap_or(0)
    }

    pub(crate) fn send_inflight_udp(&self) -> usize {
        self.link(|l| l.udp.as_ref().map(|u| u.send_inflight()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub(crate) fn flush_recv_tcp(&self) -> usize {
        self.link(|l| l.stream.flush_recv()).unwrap_or(0)
    }

    pub(crate) fn flush_recv_udp(&self) -> usize {
        self.link(|l| l.udp.as_ref().map(|u| u.flush_recv(0)).unwrap_or(0))
            .unwrap_or(0)
    }

    pub(crate) fn change_recv_limit_tcp(&self, limit: usize) -> Result<()> {
        self.link(|l| l.stream.set_recv_limit(limit))
    }

    pub(crate) fn set_auto_grow_tcp(&self, auto_grow: bool) -> Result<()> {
        self.link(|l| l.stream.set_auto_grow(auto_grow))
    }
}

impl ClientShared {
    /// The connect + handshake driver; stores the outcome in `state`.
    async fn drive_connect(
        shared: Arc<ClientShared>,
        tcp: SocketAddr,
        udp: Option<SocketAddr>,
        timeout: Duration,
    ) {
        let outcome = tokio::time::timeout(
            timeout,
            ClientShared::establish(&shared, tcp, udp),
        )
        .await;
        let mut state = shared.state.lock();
        // stop_connect may have reset the state while we ran.
        if !matches!(*state, ClientState::Connecting) {
            return;
        }
        *state = match outcome {
            Ok(Ok(link)) => {
                debug!(
                    instance = shared.instance_id,
                    client_id = link.client_id,
                    server = %link.server_tcp,
                    "connected"
                );
                ClientState::Connected(Box::new(link))
            }
            Ok(Err(err)) => {
                warn!(instance = shared.instance_id, %err, "connect failed");
                ClientState::Failed(match err {
                    NetError::ServerFull | NetError::VersionMismatch { .. } => {
                        ConnectionStatus::Refused
                    }
                    NetError::Transport(ref io)
                        if io.kind() == std::io::ErrorKind::ConnectionRefused =>
                    {
                        ConnectionStatus::Refused
                    }
                    _ => ConnectionStatus::ConnectionError,
                })
            }
            Err(_elapsed) => {
                debug!(instance = shared.instance_id, "connect timed out");
                ClientState::Failed(ConnectionStatus::TimedOut)
            }
        };
    }

    async fn establish(
        shared: &Arc<ClientShared>,
        tcp: SocketAddr,
        udp: Option<SocketAddr>,
    ) -> Result<Link> {
        let profile = &shared.profile;
        let mut stream = TcpStream::connect(tcp).await?;

        // Bind (and connect) the datagram socket first so the handshake can
        // carry its port and fire the probe through it.
        let udp_socket = match (profile.udp_enabled(), udp) {
            (true, Some(server_udp)) => {
                let local: SocketAddr = if profile.local_udp().is_unset() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    profile.local_udp().into()
                };
                let socket = bind_udp(local, profile.reusable_udp(), false).await?;
                socket.connect(server_udp).await?;
                Some(socket)
            }
            _ => None,
        };

        let admission = if profile.handshake_enabled() {
            handshake::client_handshake(&mut stream, udp_socket.as_ref()).await?
        } else {
            // No handshake: no id, no negotiated sizes; the datagram table
            // only has the server slot.
            Admission {
                client_id: 0,
                max_clients: 0,
                num_operations: profile.num_operations(),
                udp_enabled: udp_socket.is_some(),
            }
        };

        let stream_conn = StreamConnection::spawn(
            stream,
            profile.stream_config(),
            StreamTags {
                client: 0,
                instance: shared.instance_id,
            },
            &shared.handle,
        )?;

        let endpoint = match udp_socket {
            Some(socket) if admission.udp_enabled => Some(DatagramEndpoint::spawn(
                socket,
                profile.datagram_config(admission.max_clients, false),
                shared.instance_id,
                &shared.handle,
            )),
            _ => None,
        };

        Ok(Link {
            stream: stream_conn,
            udp: endpoint,
            client_id: admission.client_id,
            max_clients: admission.max_clients,
            num_operations: admission.num_operations,
            server_tcp: tcp,
            server_udp: udp,
        })
    }
}

impl Drop for ClientInstance {
    fn drop(&mut self) {
        self.disconnect();
    }
}
