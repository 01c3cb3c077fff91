//! # Reliable Stream Connection
//!
//! One [`StreamConnection`] wraps one TCP connection: a reader task that
//! drives the framing state machine, a write half guarded by an async
//! mutex, send/receive memory accounting and the two-phase shutdown state
//! machine.
//!
//! ## Serialization guarantee
//!
//! A connection has exactly one reader task, so receive completions are
//! dispatched serially and the deframer never needs internal locking.
//! Completions for different connections run in parallel on the worker
//! runtime. No ordering is guaranteed between a client's stream and
//! datagram traffic.
//!
//! ## Shutdown states
//!
//! ```text
//! Open ──shutdown()──▶ LocalSentFin ─┐
//!   │                                ├──▶ BothFin ──kill/teardown──▶ Dead
//!   └──peer FIN──────▶ RemoteSentFin ┘
//! ```
//!
//! The FIN is the TCP half-close: `shutdown()` drains pending writes and
//! closes the write half; the peer observes EOF. Once both FINs are
//! exchanged and in-flight sends have drained, the owner is notified
//! through the closed hook, but the state lingers at `BothFin` so the
//! application can still observe `NoSendRecv` and drain queued packets.
//! A non-graceful [`StreamConnection::kill`] jumps straight to `Dead` and
//! aborts in-flight operations, so the peer observes a reset instead.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{ConnectionStatus, PacketQueue, RecvCallback, SendLedger, SendStatus};
use crate::error::{NetError, Result};
use crate::framing::{frame_stream, Deframer, StreamMode};
use crate::packet::Packet;
use crate::recycle::MemoryRecycle;

/// Two-phase disconnect state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Open,
    LocalSentFin,
    RemoteSentFin,
    BothFin,
    Dead,
}

/// Everything the reader task needs that comes from the profile.
#[derive(Debug, Clone)]
pub(crate) struct StreamConfig {
    pub mode: StreamMode,
    pub postfix: Vec<u8>,
    pub recv_buffer: usize,
    pub auto_grow: bool,
    pub recv_cap: usize,
    pub send_cap: usize,
    pub send_timeout: Duration,
    pub graceful: bool,
    pub nagle: bool,
    pub recycle_depth: usize,
}

/// Routing tags stamped on every delivered packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamTags {
    /// Client the traffic originates from; `0` on a client instance (the
    /// peer is the server).
    pub client: usize,
    pub instance: usize,
}

pub(crate) struct StreamConnection {
    // Set at construction; lets `&self` methods hand an owning reference
    // to spawned tasks.
    self_weak: Weak<StreamConnection>,
    handle: Handle,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: Mutex<ShutdownState>,
    recv_queue: PacketQueue,
    send_ledger: SendLedger,
    recv_callback: Mutex<Option<RecvCallback>>,
    recycle: Mutex<MemoryRecycle>,
    // (percent, partial bytes) published by the reader after each chunk.
    progress: Mutex<(f64, usize)>,
    // Limit may grow under the auto-grow policy; reader publishes it.
    recv_limit: AtomicUsize,
    // Runtime overrides the reader applies before its next feed.
    // 0 = no pending limit change; auto-grow: 0 none, 1 off, 2 on.
    pending_limit: AtomicUsize,
    pending_auto_grow: AtomicUsize,
    inflight_ops: AtomicUsize,
    // Terminal events (graceful completion or kill) happen exactly once.
    closed: AtomicBool,
    closed_notify: Notify,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: StreamConfig,
    tags: StreamTags,
}

impl StreamConnection {
    /// Take ownership of a connected socket and start its reader task.
    pub(crate) fn spawn(
        stream: TcpStream,
        config: StreamConfig,
        tags: StreamTags,
        handle: &Handle,
    ) -> Result<Arc<StreamConnection>> {
        stream.set_nodelay(!config.nagle)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new_cyclic(|weak| StreamConnection {
            self_weak: weak.clone(),
            handle: handle.clone(),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            state: Mutex::new(ShutdownState::Open),
            recv_queue: PacketQueue::new(config.recv_cap),
            send_ledger: SendLedger::new(config.send_cap),
            recv_callback: Mutex::new(None),
            recycle: Mutex::new(MemoryRecycle::new(config.recycle_depth, config.recv_buffer)),
            progress: Mutex::new((0.0, 0)),
            recv_limit: AtomicUsize::new(config.recv_buffer),
            pending_limit: AtomicUsize::new(0),
            pending_auto_grow: AtomicUsize::new(0),
            inflight_ops: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            on_closed: Mutex::new(None),
            peer_addr,
            local_addr,
            config,
            tags,
        });

        let reader = Arc::clone(&conn);
        handle.spawn(async move { reader.read_loop(read_half).await });
        Ok(conn)
    }

    /// Install the teardown hook, fired exactly once when the connection
    /// ends — graceful completion (both FINs exchanged, in-flight sends
    /// drained) or a kill.
    pub(crate) fn set_on_closed(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.on_closed.lock() = Some(hook);
    }

    /// Install an inline receive callback; see [`RecvCallback`] for the
    /// contract. Packets already queued stay queued.
    pub(crate) fn set_recv_callback(&self, callback: Option<RecvCallback>) {
        *self.recv_callback.lock() = callback;
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut deframer = Deframer::new(
            self.config.mode,
            self.config.postfix.clone(),
            self.config.recv_buffer,
            self.config.auto_grow,
        );
        let mut chunk = vec![0u8; self.config.recv_buffer.max(1)];
        let mut completed = Vec::new();

        loop {
            // Runtime reconfiguration lands between read completions.
            let limit = self.pending_limit.swap(0, Ordering::AcqRel);
            if limit != 0 {
                deframer.set_max_buffer(limit);
            }
            match self.pending_auto_grow.swap(0, Ordering::AcqRel) {
                1 => deframer.set_auto_grow(false),
                2 => deframer.set_auto_grow(true),
                _ => {}
            }

            let n = match read_half.read(&mut chunk).await {
                Ok(0) => {
                    debug!(peer = %self.peer_addr, "stream peer sent FIN");
                    self.on_remote_fin();
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    // A reset after our own kill is expected noise.
                    if !self.is_dead() {
                        warn!(peer = %self.peer_addr, %err, "stream read failed");
                        self.kill();
                    }
                    return;
                }
            };

            if let Err(err) = deframer.feed(&chunk[..n], &mut completed) {
                warn!(peer = %self.peer_addr, %err, "stream framing failed, closing");
                self.kill();
                return;
            }
            *self.progress.lock() = (deframer.percent(), deframer.partial_bytes());
            self.recv_limit.store(deframer.max_buffer(), Ordering::Relaxed);

            for message in completed.drain(..) {
                self.deliver(message);
            }
            if self.is_dead() {
                return;
            }
        }
    }

    fn deliver(&self, message: Vec<u8>) {
        let mut packet = self.recycle.lock().acquire();
        packet.clear();
        if packet.add_str(&message, false).is_err() {
            return; // unreachable: recycled packets are never busy
        }
        let _ = packet.set_cursor(0);
        packet.tag_received(self.tags.client, 0, self.tags.instance);

        let callback = self.recv_callback.lock().clone();
        if let Some(callback) = callback {
            callback(packet);
            return;
        }
        if self.recv_queue.can_accept(packet.used_size()) {
            let _ = self.recv_queue.push(packet);
        } else {
            warn!(
                peer = %self.peer_addr,
                queued = self.recv_queue.bytes(),
                cap = self.recv_queue.cap(),
                "receive queue full, stream packet dropped"
            );
            self.recv_queue.note_drop();
            self.recycle.lock().release(packet);
        }
    }

    /// Pop the next received packet, if any.
    pub(crate) fn recv(&self) -> Option<Packet> {
        self.recv_queue.pop()
    }

    /// Frame and send `payload`.
    ///
    /// Blocking sends wait for the write to complete, up to the profile's
    /// send timeout; on timeout the connection is terminated and
    /// [`NetError::SendTimeout`] is returned. Non-blocking sends reserve
    /// cap space, post the write and return [`SendStatus::InProgress`].
    pub(crate) async fn send(&self, payload: &[u8], block: bool) -> Result<SendStatus> {
        match *self.state.lock() {
            ShutdownState::Open | ShutdownState::RemoteSentFin => {}
            _ => return Err(NetError::Shutdown),
        }
        let framed = frame_stream(payload, self.config.mode, &self.config.postfix)?;
        self.send_ledger.reserve(framed.len())?;

        if block {
            self.write_framed(framed).await
        } else {
            let conn = self
                .self_weak
                .upgrade()
                .expect("caller holds a strong reference");
            self.inflight_ops.fetch_add(1, Ordering::AcqRel);
            self.handle.spawn(async move {
                if let Err(err) = conn.write_framed(framed).await {
                    debug!(peer = %conn.peer_addr, %err, "background send failed");
                }
                conn.inflight_ops.fetch_sub(1, Ordering::AcqRel);
                conn.maybe_closed();
            });
            Ok(SendStatus::InProgress)
        }
    }

    async fn write_framed(&self, framed: Vec<u8>) -> Result<SendStatus> {
        let bytes = framed.len();
        let result = tokio::time::timeout(self.config.send_timeout, async {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_all(&framed).await.map_err(NetError::from),
                None => Err(NetError::Shutdown),
            }
        })
        .await;
        self.send_ledger.release(bytes);

        match result {
            Ok(Ok(())) => Ok(SendStatus::Completed),
            Ok(Err(err)) => {
                if err.is_fatal_to_connection() {
                    self.kill();
                }
                Err(err)
            }
            Err(_elapsed) => {
                warn!(peer = %self.peer_addr, "send timed out, terminating connection");
                self.kill();
                Err(NetError::SendTimeout)
            }
        }
    }

    /// Graceful half-close: drain pending writes, send the FIN, stop
    /// accepting local sends. Receiving continues until the peer's FIN.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ShutdownState::Open => *state = ShutdownState::LocalSentFin,
                ShutdownState::RemoteSentFin => *state = ShutdownState::BothFin,
                _ => return Err(NetError::Shutdown),
            }
        }
        // The writer mutex serializes this behind any write in progress,
        // which is the "send queue drains first" guarantee.
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let _ = writer.shutdown().await;
        }
        *guard = None;
        drop(guard);
        debug!(peer = %self.peer_addr, "local FIN sent");
        self.maybe_closed();
        Ok(())
    }

    fn on_remote_fin(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ShutdownState::Open => *state = ShutdownState::RemoteSentFin,
                ShutdownState::LocalSentFin => *state = ShutdownState::BothFin,
                _ => return,
            }
        }
        if !self.config.graceful {
            // Without graceful disconnect a peer FIN is simply the end.
            self.kill();
            return;
        }
        self.maybe_closed();
    }

    /// Abortive termination: straight to `Dead`, in-flight operations are
    /// abandoned, the peer observes a reset.
    pub(crate) fn kill(&self) {
        {
            let mut state = self.state.lock();
            if *state == ShutdownState::Dead {
                return;
            }
            *state = ShutdownState::Dead;
        }
        debug!(peer = %self.peer_addr, "stream connection dead");
        self.finish_closed();
    }

    /// Graceful completion check: both FINs exchanged and every in-flight
    /// send drained. The state stays `BothFin` so the application can
    /// still observe `NoSendRecv` and drain queued packets; the owner is
    /// told through the closed hook.
    fn maybe_closed(&self) {
        {
            let state = self.state.lock();
            if *state != ShutdownState::BothFin || self.inflight_ops.load(Ordering::Acquire) != 0 {
                return;
            }
        }
        debug!(peer = %self.peer_addr, "graceful disconnect complete");
        self.finish_closed();
    }

    fn finish_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hook = self.on_closed.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.closed_notify.notify_waiters();
        // Dropping the write half closes the socket; tolerate a writer
        // mid-send, whose error path drops it instead.
        if let Ok(mut guard) = self.writer.try_lock() {
            *guard = None;
        }
    }

    /// Wait until the connection has ended (gracefully or by kill).
    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_dead(&self) -> bool {
        *self.state.lock() == ShutdownState::Dead
    }

    /// Shutdown state as observed through the public API.
    pub(crate) fn status(&self) -> ConnectionStatus {
        match *self.state.lock() {
            ShutdownState::Open => ConnectionStatus::Connected,
            ShutdownState::LocalSentFin => ConnectionStatus::NoSend,
            ShutdownState::RemoteSentFin => ConnectionStatus::NoRecv,
            ShutdownState::BothFin => ConnectionStatus::NoSendRecv,
            ShutdownState::Dead => ConnectionStatus::NotConnected,
        }
    }

    // ---- introspection --------------------------------------------------

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Progress of the partial message being reassembled, 0–100.
    pub(crate) fn percent(&self) -> f64 {
        self.progress.lock().0
    }

    /// Bytes accumulated toward the partial message.
    pub(crate) fn partial_bytes(&self) -> usize {
        self.progress.lock().1
    }

    /// Current reassembly limit (grows under auto-grow).
    pub(crate) fn recv_limit(&self) -> usize {
        self.recv_limit.load(Ordering::Relaxed)
    }

    /// Request a new reassembly limit; applied before the next read.
    pub(crate) fn set_recv_limit(&self, limit: usize) {
        self.pending_limit.store(limit.max(1), Ordering::Release);
        self.recv_limit.store(limit.max(1), Ordering::Relaxed);
    }

    /// Request an auto-grow policy change; applied before the next read.
    pub(crate) fn set_auto_grow(&self, auto_grow: bool) {
        self.pending_auto_grow
            .store(if auto_grow { 2 } else { 1 }, Ordering::Release);
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.recv_queue.len()
    }

    pub(crate) fn queue_bytes(&self) -> usize {
        self.recv_queue.bytes()
    }

    pub(crate) fn flush_recv(&self) -> usize {
        self.recv_queue.flush()
    }

    pub(crate) fn send_inflight(&self) -> usize {
        self.send_ledger.inflight()
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("peer", &self.peer_addr)
            .field("state", &*self.state.lock())
            .field("queued", &self.recv_queue.len())
            .finish()
    }
}
