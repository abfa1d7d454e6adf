//! External address acquisition.
//!
//! Port mapping (UPnP, NAT-PMP...) lives outside this crate; the listener
//! only asks for the resulting public endpoint.

use async_trait::async_trait;
use std::net::SocketAddr;

#[async_trait]
pub trait ExternalAddressProvider: Send + Sync {
    /// Public endpoint that forwards to `local_port`, if one can be obtained.
    async fn acquire_external_endpoint(&self, local_port: u16) -> Option<SocketAddr>;

    /// Give the mapping back when the listener stops.
    async fn release_external_endpoint(&self, _local_port: u16) {}
}

/// No NAT traversal; the server is only reachable on its local address.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalAddress;

#[async_trait]
impl ExternalAddressProvider for NoExternalAddress {
    async fn acquire_external_endpoint(&self, _local_port: u16) -> Option<SocketAddr> {
        None
    }
}

/// A fixed public address, e.g. a manually forwarded router port.
#[derive(Debug, Clone, Copy)]
pub struct StaticExternalAddress(pub SocketAddr);

#[async_trait]
impl ExternalAddressProvider for StaticExternalAddress {
    async fn acquire_external_endpoint(&self, _local_port: u16) -> Option<SocketAddr> {
        Some(self.0)
    }
}
