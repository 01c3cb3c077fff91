//! # Error Types and Last-Error Context
//!
//! This module defines the closed set of error kinds surfaced by the library,
//! together with the per-thread last-error slot that backs the poll-style
//! parts of the public API.
//!
//! ## Error Families
//!
//! - **Argument/precondition**: bad instance id, wrong instance type, bad
//!   client id, inconsistent profile
//! - **Capacity**: send/receive memory caps, stream reassembly overflow,
//!   server full
//! - **State**: sending on a shut-down connection, packet underflow, packet
//!   busy with an outstanding cipher task
//! - **Timeout**: connect, handshake and per-send timeouts
//! - **Transport**: OS socket errors; these terminate the affected
//!   connection, never the whole instance
//!
//! ## Poll-Style Error Reporting
//!
//! Status-returning calls (`ConnectionStatus`, `SendStatus`, the numeric
//! getters) cannot carry error detail in their return value. Whenever such a
//! call fails, the detailed error is stored in a thread-local slot and can be
//! retrieved with [`take_last_error`]. The slot belongs to the calling
//! thread, so concurrent callers never observe each other's failures.

use std::cell::RefCell;
use thiserror::Error;

/// Errors produced by the networking engine.
///
/// The set is closed: every failure a public operation can report maps onto
/// exactly one of these variants. Operations are atomic with respect to the
/// calling thread; on failure the observable state is unchanged except where
/// the error itself is the side effect (send accounting, buffer growth).
#[derive(Debug, Error)]
pub enum NetError {
    /// The instance id is outside the registry's slot table.
    #[error("invalid instance id {0}")]
    InvalidInstance(usize),

    /// The instance exists but is the wrong kind for the operation.
    #[error("instance {id} is {actual}, operation requires {required}")]
    WrongInstanceType {
        id: usize,
        actual: &'static str,
        required: &'static str,
    },

    /// The client id is zero, above `max_clients`, or not currently connected.
    #[error("invalid client id {0}")]
    InvalidClient(usize),

    /// The operation id is not below the configured `num_operations`.
    #[error("invalid operation id {id}, instance has {num_operations} operations")]
    InvalidOperation { id: usize, num_operations: usize },

    /// The profile is internally inconsistent (e.g. postfix framing with an
    /// empty postfix).
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// Accepting the packet would push the connection's in-flight send bytes
    /// over its cap.
    #[error("send of {requested} bytes would exceed send memory cap ({inflight} in flight, cap {cap})")]
    SendCapExceeded {
        requested: usize,
        inflight: usize,
        cap: usize,
    },

    /// The receive queue is at its byte cap; the packet was dropped.
    #[error("receive queue at capacity ({queued} of {cap} bytes), packet dropped")]
    RecvCapExceeded { queued: usize, cap: usize },

    /// A length-prefixed stream message announced a size beyond the receive
    /// buffer limit and auto-grow is off. Terminates the connection.
    #[error("incoming message of {target} bytes exceeds receive buffer limit of {max} bytes")]
    BufferOverflow { target: usize, max: usize },

    /// The server has no free client ids.
    #[error("server is full")]
    ServerFull,

    /// The connection no longer accepts sends in this direction.
    #[error("connection is shut down")]
    Shutdown,

    /// The instance has no live connection.
    #[error("not connected")]
    NotConnected,

    /// A connect attempt is already in progress on this instance.
    #[error("connect already in progress")]
    AlreadyConnecting,

    /// A typed read ran past the packet's used size. The cursor is unchanged.
    #[error("packet underflow: needed {requested} bytes, {available} remain")]
    PacketUnderflow { requested: usize, available: usize },

    /// The packet has an outstanding asynchronous cipher task.
    #[error("packet is busy with an outstanding cipher task")]
    PacketBusy,

    /// The peer did not complete the admission handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A blocking send did not complete within the profile's send timeout.
    /// The owning connection has been terminated.
    #[error("send timed out")]
    SendTimeout,

    /// The connect attempt did not complete within the caller's timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: ours {ours}, peer {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    /// The peer violated the wire protocol (malformed control message,
    /// traffic on a disabled stream, short datagram header).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An OS-level socket error. Terminates the affected connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl NetError {
    /// Whether the error must terminate the connection it occurred on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            NetError::BufferOverflow { .. }
                | NetError::SendTimeout
                | NetError::Transport(_)
                | NetError::Protocol(_)
        )
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<NetError>> = const { RefCell::new(None) };
}

/// Store `err` as the calling thread's last error, returning it for chaining.
pub(crate) fn record(err: NetError) -> NetError {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(match &err {
            // io::Error is not Clone; keep the kind and text.
            NetError::Transport(io) => {
                NetError::Transport(std::io::Error::new(io.kind(), io.to_string()))
            }
            other => clone_variant(other),
        });
    });
    err
}

/// Take the detailed error behind the most recent failing poll-style call on
/// this thread, clearing the slot.
pub fn take_last_error() -> Option<NetError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

fn clone_variant(err: &NetError) -> NetError {
    match err {
        NetError::InvalidInstance(id) => NetError::InvalidInstance(*id),
        NetError::WrongInstanceType { id, actual, required } => NetError::WrongInstanceType {
            id: *id,
            actual: *actual,
            required: *required,
        },
        NetError::InvalidClient(id) => NetError::InvalidClient(*id),
        NetError::InvalidOperation { id, num_operations } => NetError::InvalidOperation {
            id: *id,
            num_operations: *num_operations,
        },
        NetError::InvalidProfile(msg) => NetError::InvalidProfile(msg.clone()),
        NetError::SendCapExceeded {
            requested,
            inflight,
            cap,
        } => NetError::SendCapExceeded {
            requested: *requested,
            inflight: *inflight,
            cap: *cap,
        },
        NetError::RecvCapExceeded { queued, cap } => NetError::RecvCapExceeded {
            queued: *queued,
            cap: *cap,
        },
        NetError::BufferOverflow { target, max } => NetError::BufferOverflow {
            target: *target,
            max: *max,
        },
        NetError::ServerFull => NetError::ServerFull,
        NetError::Shutdown => NetError::Shutdown,
        NetError::NotConnected => NetError::NotConnected,
        NetError::AlreadyConnecting => NetError::AlreadyConnecting,
        NetError::PacketUnderflow { requested, available } => NetError::PacketUnderflow {
            requested: *requested,
            available: *available,
        },
        NetError::PacketBusy => NetError::PacketBusy,
        NetError::HandshakeTimeout => NetError::HandshakeTimeout,
        NetError::SendTimeout => NetError::SendTimeout,
        NetError::ConnectTimeout => NetError::ConnectTimeout,
        NetError::VersionMismatch { ours, theirs } => NetError::VersionMismatch {
            ours: *ours,
            theirs: *theirs,
        },
        NetError::Protocol(msg) => NetError::Protocol(msg.clone()),
        NetError::Transport(io) => {
            NetError::Transport(std::io::Error::new(io.kind(), io.to_string()))
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = NetError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_per_thread() {
        record(NetError::ServerFull);
        let handle = std::thread::spawn(|| take_last_error().is_none());
        assert!(handle.join().unwrap(), "other thread saw this thread's error");
        assert!(matches!(take_last_error(), Some(NetError::ServerFull)));
        // Taking clears the slot.
        assert!(take_last_error().is_none());
    }

    #[test]
    fn fatal_classification() {
        assert!(NetError::SendTimeout.is_fatal_to_connection());
        assert!(NetError::BufferOverflow { target: 10, max: 5 }.is_fatal_to_connection());
        assert!(!NetError::ServerFull.is_fatal_to_connection());
        assert!(!NetError::PacketBusy.is_fatal_to_connection());
    }
}
