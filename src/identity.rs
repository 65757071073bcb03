// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tunnel identities and the allocation daemon's settings

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::config::Config;
use crate::keys::Keypair;

/// The gateway's own keypair and tunnel endpoint
#[derive(Debug, Clone)]
pub struct GatewayIdentity {
    pub keypair: Keypair,
    /// Gateway address with the tunnel network prefix, e.g. `10.0.0.1/24`
    pub address: Ipv4Net,
    pub listen_port: u16,
}

impl GatewayIdentity {
    pub fn new(keypair: Keypair, config: &Config) -> Self {
        Self {
            keypair,
            address: config.gateway.address,
            listen_port: config.gateway.listen_port,
        }
    }
}

/// The single client peer
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub keypair: Keypair,
    /// Host route for the client, e.g. `10.0.0.2/32`
    pub address: Ipv4Net,
}

impl ClientIdentity {
    pub fn new(keypair: Keypair, config: &Config) -> Self {
        Self {
            keypair,
            address: config.client.address,
        }
    }
}

/// Settings rendered for the peer-allocation daemon.
///
/// The daemon shares the gateway's keypair rather than holding its own.
#[derive(Clone, Serialize)]
pub struct AllocationServiceConfig {
    pub listen_address: SocketAddr,
    pub private_key: String,
    pub public_key: String,
    pub peer_limit: u32,
    #[serde(rename = "database")]
    pub database_path: PathBuf,
    #[serde(rename = "interface")]
    pub interface_name: String,
}

impl fmt::Debug for AllocationServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationServiceConfig")
            .field("listen_address", &self.listen_address)
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("peer_limit", &self.peer_limit)
            .field("database_path", &self.database_path)
            .field("interface_name", &self.interface_name)
            .finish()
    }
}

impl AllocationServiceConfig {
    pub fn for_gateway(gateway: &GatewayIdentity, config: &Config) -> Self {
        Self {
            listen_address: config.allocator.listen_address,
            private_key: gateway.keypair.private_key.clone(),
            public_key: gateway.keypair.public_key.clone(),
            peer_limit: config.allocator.peer_limit,
            database_path: config.allocator.database.clone(),
            interface_name: config.gateway.interface.clone(),
        }
    }
}
