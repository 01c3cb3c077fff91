//! # Instances
//!
//! An instance is one endpoint owned by the registry: a [`client`]
//! (one stream to a server plus an optional datagram endpoint), a
//! [`server`] (listener, admission table and per-client connections), or a
//! [`broadcast`] endpoint (connectionless datagrams on a broadcast
//! address). A registry slot that has not been started yet is `Inactive`.

pub mod broadcast;
pub mod client;
pub mod server;

use broadcast::BroadcastInstance;
use client::ClientInstance;
use server::ServerInstance;

/// What occupies a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    /// The slot is empty.
    Inactive,
    /// A connecting/connected client endpoint.
    Client,
    /// A listening server endpoint.
    Server,
    /// A connectionless broadcast endpoint.
    Broadcast,
}

pub(crate) enum Instance {
    Inactive,
    Client(ClientInstance),
    Server(ServerInstance),
    Broadcast(BroadcastInstance),
}

impl Instance {
    pub(crate) fn kind(&self) -> InstanceType {
        match self {
            Instance::Inactive => InstanceType::Inactive,
            Instance::Client(_) => InstanceType::Client,
            Instance::Server(_) => InstanceType::Server,
            Instance::Broadcast(_) => InstanceType::Broadcast,
        }
    }
}
