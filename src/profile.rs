//! # Instance Profile
//!
//! A [`Profile`] is the bag of knobs applied when an instance starts:
//! buffer sizes, framing and demux modes, timeouts, memory caps, socket
//! options. It is immutable once an instance has consumed it — the few
//! runtime-adjustable values (server timeout, per-client buffer sizing)
//! have dedicated calls on the instance instead.
//!
//! Every option has a symmetric setter/getter pair. Consistency is checked
//! once, at instance start, by [`Profile::validate`].

use std::time::Duration;

use crate::addr::{NetAddress, UNSET};
use crate::crypto::CipherKey;
use crate::error::{NetError, Result};
use crate::framing::StreamMode;
use crate::transport::datagram::{DatagramConfig, DatagramMode};
use crate::transport::stream::StreamConfig;

/// Configuration applied at instance construction.
#[derive(Debug, Clone)]
pub struct Profile {
    recv_size_tcp: usize,
    recv_size_udp: usize,
    udp_enabled: bool,
    auto_grow_tcp: bool,
    handshake_enabled: bool,
    graceful_disconnect: bool,
    mode_tcp: StreamMode,
    mode_udp: DatagramMode,
    postfix_tcp: Vec<u8>,
    send_timeout: Duration,
    server_timeout: Duration,
    nagle_enabled: bool,
    local_tcp: NetAddress,
    local_udp: NetAddress,
    decrypt_key_udp: Option<CipherKey>,
    reusable_udp: bool,
    num_operations: usize,
    send_cap_tcp: usize,
    recv_cap_tcp: usize,
    send_cap_udp: usize,
    recv_cap_udp: usize,
    recycle_depth: usize,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            recv_size_tcp: crate::defaults::RECV_SIZE_TCP,
            recv_size_udp: crate::defaults::RECV_SIZE_UDP,
            udp_enabled: true,
            auto_grow_tcp: false,
            handshake_enabled: true,
            graceful_disconnect: true,
            mode_tcp: StreamMode::PrefixSize,
            mode_udp: DatagramMode::CatchAll,
            postfix_tcp: Vec::new(),
            send_timeout: crate::defaults::SEND_TIMEOUT,
            server_timeout: crate::defaults::SERVER_TIMEOUT,
            nagle_enabled: false,
            local_tcp: UNSET,
            local_udp: UNSET,
            decrypt_key_udp: None,
            reusable_udp: false,
            num_operations: 1,
            send_cap_tcp: crate::defaults::SEND_CAP,
            recv_cap_tcp: crate::defaults::RECV_CAP,
            send_cap_udp: crate::defaults::SEND_CAP,
            recv_cap_udp: crate::defaults::RECV_CAP,
            recycle_depth: crate::defaults::RECYCLE_DEPTH,
        }
    }
}

macro_rules! knob {
    ($(#[$doc:meta])* $get:ident, $set:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $get(&self) -> $ty {
            self.$get
        }

        pub fn $set(&mut self, value: $ty) -> &mut Self {
            self.$get = value;
            self
        }
    };
}

impl Profile {
    pub fn new() -> Profile {
        Profile::default()
    }

    knob!(
        /// Stream receive buffer: read chunk size, the initial reassembly
        /// limit, and the nominal recycle packet size.
        recv_size_tcp, set_recv_size_tcp, usize);
    knob!(
        /// Largest datagram the endpoint can receive.
        recv_size_udp, set_recv_size_udp, usize);
    knob!(
        /// Whether the instance opens a datagram endpoint at all.
        udp_enabled, set_udp_enabled, bool);
    knob!(
        /// Grow the stream reassembly limit to fit oversize messages
        /// instead of killing the connection.
        auto_grow_tcp, set_auto_grow_tcp, bool);
    knob!(
        /// Run the admission handshake. Disabling it admits connections
        /// immediately, with no version gate and no trusted UDP address.
        handshake_enabled, set_handshake_enabled, bool);
    knob!(
        /// Two-phase disconnect: drain both directions before the client
        /// id is released. Off means disconnects abort in-flight traffic.
        graceful_disconnect, set_graceful_disconnect, bool);
    knob!(
        /// Stream framing mode.
        mode_tcp, set_mode_tcp, StreamMode);
    knob!(
        /// Datagram demultiplexing mode.
        mode_udp, set_mode_udp, DatagramMode);
    knob!(
        /// Per-send deadline for blocking sends; expiry kills the
        /// connection.
        send_timeout, set_send_timeout, Duration);
    knob!(
        /// Server-side bound on the whole admission handshake.
        server_timeout, set_server_timeout, Duration);
    knob!(
        /// Leave Nagle's algorithm on instead of setting `TCP_NODELAY`.
        nagle_enabled, set_nagle_enabled, bool);
    knob!(
        /// Explicit local TCP bind address; unset picks an ephemeral port.
        local_tcp, set_local_tcp, NetAddress);
    knob!(
        /// Explicit local UDP bind address; unset picks an ephemeral port.
        local_udp, set_local_udp, NetAddress);
    knob!(
        /// Allow rebinding the UDP port (`SO_REUSEADDR`).
        reusable_udp, set_reusable_udp, bool);
    knob!(
        /// Datagram operation count for the per-operation demux mode.
        num_operations, set_num_operations, usize);
    knob!(
        /// Cap on in-flight stream send bytes per connection.
        send_cap_tcp, set_send_cap_tcp, usize);
    knob!(
        /// Cap on queued stream receive bytes per connection.
        recv_cap_tcp, set_recv_cap_tcp, usize);
    knob!(
        /// Cap on in-flight datagram send bytes.
        send_cap_udp, set_send_cap_udp, usize);
    knob!(
        /// Cap on queued datagram receive bytes per queue.
        recv_cap_udp, set_recv_cap_udp, usize);
    knob!(
        /// How many receive packets each connection recycles.
        recycle_depth, set_recycle_depth, usize);

    /// Sentinel appended to every outgoing message in postfix framing.
    pub fn postfix_tcp(&self) -> &[u8] {
        &self.postfix_tcp
    }

    pub fn set_postfix_tcp(&mut self, postfix: &[u8]) -> &mut Self {
        self.postfix_tcp = postfix.to_vec();
        self
    }

    /// Key used to decrypt catch-all datagrams in place, if any.
    pub fn decrypt_key_udp(&self) -> Option<&CipherKey> {
        self.decrypt_key_udp.as_ref()
    }

    pub fn set_decrypt_key_udp(&mut self, key: Option<CipherKey>) -> &mut Self {
        self.decrypt_key_udp = key;
        self
    }

    /// Check internal consistency. Called once when an instance starts.
    pub fn validate(&self) -> Result<()> {
        if self.mode_tcp == StreamMode::Postfix && self.postfix_tcp.is_empty() {
            return Err(NetError::InvalidProfile(
                "postfix framing requires a nonempty postfix".into(),
            ));
        }
        if self.num_operations == 0 {
            return Err(NetError::InvalidProfile(
                "num_operations must be at least 1".into(),
            ));
        }
        if self.recv_size_tcp == 0 || self.recv_size_udp == 0 {
            return Err(NetError::InvalidProfile(
                "receive buffer sizes must be nonzero".into(),
            ));
        }
        if self.decrypt_key_udp.is_some()
            && !matches!(self.mode_udp, DatagramMode::CatchAllNo)
        {
            return Err(NetError::InvalidProfile(
                "a UDP decrypt key is only consulted in catch-all-no mode".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            mode: self.mode_tcp,
            postfix: self.postfix_tcp.clone(),
            recv_buffer: self.recv_size_tcp,
            auto_grow: self.auto_grow_tcp,
            recv_cap: self.recv_cap_tcp,
            send_cap: self.send_cap_tcp,
            send_timeout: self.send_timeout,
            graceful: self.graceful_disconnect,
            nagle: self.nagle_enabled,
            recycle_depth: self.recycle_depth,
        }
    }

    pub(crate) fn datagram_config(&self, max_clients: usize, verify_source: bool) -> DatagramConfig {
        DatagramConfig {
            mode: self.mode_udp,
            num_operations: self.num_operations,
            max_clients,
            recv_buffer: self.recv_size_udp,
            recv_cap: self.recv_cap_udp,
            send_cap: self.send_cap_udp,
            send_timeout: self.send_timeout,
            decrypt_key: self.decrypt_key_udp.clone(),
            recycle_depth: self.recycle_depth,
            verify_source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        Profile::default().validate().unwrap();
    }

    #[test]
    fn postfix_mode_requires_a_sentinel() {
        let mut profile = Profile::new();
        profile.set_mode_tcp(StreamMode::Postfix);
        assert!(matches!(
            profile.validate(),
            Err(NetError::InvalidProfile(_))
        ));
        profile.set_postfix_tcp(&[0xDE, 0xAD]);
        profile.validate().unwrap();
    }

    #[test]
    fn zero_operations_is_invalid() {
        let mut profile = Profile::new();
        profile.set_num_operations(0);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn decrypt_key_only_in_catch_all_no() {
        let mut profile = Profile::new();
        profile.set_decrypt_key_udp(Some(CipherKey::from_bytes(&[1; 32]).unwrap()));
        assert!(profile.validate().is_err());
        profile.set_mode_udp(DatagramMode::CatchAllNo);
        profile.validate().unwrap();
    }

    #[test]
    fn setters_and_getters_are_symmetric() {
        let mut profile = Profile::new();
        profile
            .set_recv_size_tcp(1 << 20)
            .set_auto_grow_tcp(true)
            .set_udp_enabled(false)
            .set_num_operations(4)
            .set_send_timeout(Duration::from_millis(250))
            .set_postfix_tcp(b"\r\n");
        assert_eq!(profile.recv_size_tcp(), 1 << 20);
        assert!(profile.auto_grow_tcp());
        assert!(!profile.udp_enabled());
        assert_eq!(profile.num_operations(), 4);
        assert_eq!(profile.send_timeout(), Duration::from_millis(250));
        assert_eq!(profile.postfix_tcp(), b"\r\n");
    }
}
