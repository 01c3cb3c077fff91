//! # msglink
//!
//! A message-oriented networking library: reliable framed streams over
//! TCP, unreliable datagrams over UDP with pluggable demultiplexing, a
//! server-side admission handshake with capacity control, and a shared
//! worker pool that drives it all.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────┐   ┌────────────────────┐   ┌───────────────────────┐
//! │ Application│──▶│ Registry (dense    │──▶│ Instances: client /   │
//! │ (poll-style│   │ ids, worker pool)  │   │ server / broadcast    │
//! │  calls)    │   └────────────────────┘   └──────────┬────────────┘
//! └────────────┘                                       │
//!                     ┌────────────────────────────────┴───────────┐
//!                     │ Transports: framed stream connections and  │
//!                     │ demultiplexing datagram endpoints, built   │
//!                     │ on Packet / framing / crypto primitives    │
//!                     └────────────────────────────────────────────┘
//! ```
//!
//! - [`Packet`] — owning byte buffer with a cursor, typed native-endian
//!   accessors, prefix strings and in-place encryption
//! - [`StreamMode`] — four interchangeable stream framing modes
//! - [`DatagramMode`] — four datagram demultiplexing modes
//! - [`Profile`] — the knob bag applied at instance construction
//! - [`Registry`] — owner of instances and the worker pool; the public
//!   poll-style API surface
//!
//! ## Quick sketch
//!
//! ```no_run
//! use msglink::{NetAddress, Packet, Profile, Registry};
//! use std::time::Duration;
//!
//! let net = Registry::start(2, 4)?;
//! net.start_server(0, 16, Profile::default())?;
//! let server_tcp = net.local_tcp_addr(0)?;
//! let server_udp = net.local_udp_addr(0)?;
//!
//! net.connect(1, server_tcp, Some(server_udp),
//!     Duration::from_secs(5), true, Profile::default())?;
//!
//! let mut packet = Packet::new();
//! packet.add_str(b"hello!!", false)?;
//! net.send_tcp(1, &mut packet, 0, false, true);
//! # Ok::<(), msglink::NetError>(())
//! ```
//!
//! ## Concurrency model
//!
//! A fixed pool of worker threads (chosen at [`Registry::start`]) drives
//! every connection; application threads call the public API concurrently.
//! Per-connection dispatch is serial, so the protocol state machines need
//! no internal concurrency. Blocking entry points drive the pool runtime,
//! which makes `num_threads == 0` a deterministic caller-driven mode.
//!
//! ## Byte-order caveat
//!
//! Packet scalars travel in native byte order: wire compatibility is
//! guaranteed between hosts of the same endianness only. Size-typed
//! integers (string prefixes, datagram demux headers) are always 8-byte
//! little-endian.

pub mod addr;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod instance;
pub mod packet;
pub mod profile;
pub mod recycle;
pub mod registry;
pub mod transport;

mod pool;

pub use addr::{resolve, NetAddress, UNSET};
pub use crypto::{CipherKey, CipherStatus};
pub use error::{take_last_error, NetError, Result};
pub use framing::StreamMode;
pub use handshake::{RejectReason, PROTOCOL_VERSION};
pub use instance::InstanceType;
pub use packet::{Packet, Scalar};
pub use profile::Profile;
pub use recycle::MemoryRecycle;
pub use registry::Registry;
pub use transport::datagram::DatagramMode;
pub use transport::{ConnectionStatus, RecvCallback, SendStatus};

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Stream receive buffer and initial reassembly limit.
    pub const RECV_SIZE_TCP: usize = 8192;

    /// Largest receivable datagram.
    pub const RECV_SIZE_UDP: usize = 8192;

    /// Per-connection cap on in-flight send bytes.
    pub const SEND_CAP: usize = 1 << 20;

    /// Per-queue cap on buffered receive bytes.
    pub const RECV_CAP: usize = 16 << 20;

    /// Blocking-send deadline; expiry kills the connection.
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

    /// Server-side bound on the admission handshake.
    pub const SERVER_TIMEOUT: Duration = Duration::from_secs(10);

    /// Receive packets recycled per connection.
    pub const RECYCLE_DEPTH: usize = 32;
}
