// SPDX-License-Identifier: AGPL-3.0-or-later
//! wg-quick style documents for the gateway and its client

use std::fmt::{self, Write as FmtWrite};
use std::net::{Ipv6Addr, SocketAddr};

use ipnet::Ipv4Net;

use super::HEADER;
use crate::identity::{ClientIdentity, GatewayIdentity};

/// Every route the client sends through the tunnel
pub const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0, ::/0";

pub(super) fn gateway_document(
    gateway: &GatewayIdentity,
    peer_public_key: &str,
    peer_address: Ipv4Net,
) -> Result<String, fmt::Error> {
    let mut doc = String::new();

    writeln!(doc, "{}", HEADER)?;
    writeln!(doc, "[Interface]")?;
    writeln!(doc, "PrivateKey = {}", gateway.keypair.private_key)?;
    writeln!(doc, "Address = {}", gateway.address)?;
    writeln!(doc, "ListenPort = {}", gateway.listen_port)?;
    writeln!(doc)?;
    writeln!(doc, "[Peer]")?;
    writeln!(doc, "PublicKey = {}", peer_public_key)?;
    // host route only: the gateway accepts nothing else from this peer
    writeln!(doc, "AllowedIPs = {}/32", peer_address.addr())?;

    Ok(doc)
}

pub(super) struct ClientDocument<'a> {
    pub client: &'a ClientIdentity,
    pub gateway_network: Ipv4Net,
    pub gateway_public_key: &'a str,
    pub endpoint: &'a str,
    pub dns: &'a str,
    pub persistent_keepalive: u16,
}

impl ClientDocument<'_> {
    pub(super) fn render(&self) -> Result<String, fmt::Error> {
        let mut doc = String::new();

        writeln!(doc, "{}", HEADER)?;
        writeln!(doc, "[Interface]")?;
        writeln!(doc, "PrivateKey = {}", self.client.keypair.private_key)?;
        writeln!(
            doc,
            "Address = {}/{}",
            self.client.address.addr(),
            self.gateway_network.prefix_len()
        )?;
        writeln!(doc, "DNS = {}", self.dns)?;
        writeln!(doc)?;
        writeln!(doc, "[Peer]")?;
        writeln!(doc, "PublicKey = {}", self.gateway_public_key)?;
        writeln!(doc, "Endpoint = {}", self.endpoint)?;
        writeln!(doc, "AllowedIPs = {}", CLIENT_ALLOWED_IPS)?;
        writeln!(doc, "PersistentKeepalive = {}", self.persistent_keepalive)?;

        Ok(doc)
    }
}

/// Join a public host and the listen port into an `Endpoint` value.
///
/// A host that already carries a port is kept as given; bare IPv6 literals
/// are bracketed. `None` when the value cannot form a valid endpoint.
pub fn format_endpoint(host: &str, port: u16) -> Option<String> {
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr.to_string());
    }
    if let Ok(v6) = host.trim_matches(|c| c == '[' || c == ']').parse::<Ipv6Addr>() {
        return Some(format!("[{}]:{}", v6, port));
    }
    match host.rsplit_once(':') {
        Some((name, explicit)) => {
            let valid = !name.is_empty()
                && !name.contains([':', '[', ']'])
                && explicit.parse::<u16>().map(|p| p != 0).unwrap_or(false);
            valid.then(|| host.to_string())
        }
        None => Some(format!("{}:{}", host, port)),
    }
}

/// File name stem for a base64 public key (`/` and `+` are not path safe).
pub fn key_file_stem(public_key: &str) -> String {
    public_key
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '/' => '_',
            '+' => '-',
            other => other,
        })
        .collect()
}
