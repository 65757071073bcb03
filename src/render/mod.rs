// SPDX-License-Identifier: AGPL-3.0-or-later
//! Config rendering and writing
//!
//! Renders the three documents a provisioning run produces: the gateway
//! interface config, the allocation daemon config and the client config.
//! Rendering is pure; [`RenderedConfigFile::write`] is the only step that
//! touches the filesystem.

mod allocator;
mod wireguard;

pub use wireguard::{format_endpoint, key_file_stem, CLIENT_ALLOWED_IPS};

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use ipnet::Ipv4Net;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::identity::{AllocationServiceConfig, ClientIdentity, GatewayIdentity};

/// Read/write for the owner, nothing for group or others
pub const OWNER_ONLY: u32 = 0o600;

/// Mode for directories created to hold rendered secrets
pub const OWNER_ONLY_DIR: u32 = 0o700;

const HEADER: &str = "# Managed by wg-provision. Local edits are overwritten.";

/// A rendered document and where it goes
#[derive(Clone)]
pub struct RenderedConfigFile {
    pub path: PathBuf,
    pub content: String,
    pub mode: u32,
}

impl fmt::Debug for RenderedConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // content holds private keys
        f.debug_struct("RenderedConfigFile")
            .field("path", &self.path)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("bytes", &self.content.len())
            .finish()
    }
}

impl RenderedConfigFile {
    fn secret(path: PathBuf, content: String) -> Self {
        Self {
            path,
            content,
            mode: OWNER_ONLY,
        }
    }

    /// Write the document, creating parent directories as needed.
    ///
    /// The mode is applied on creation and again on the open handle, so a
    /// pre-existing file with wider permissions is narrowed before any
    /// content lands in it.
    pub fn write(&self) -> Result<()> {
        let write_error = |source: std::io::Error| GatewayError::ConfigWrite {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(OWNER_ONLY_DIR);
                }
                builder.create(parent).map_err(write_error)?;
            }
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.mode);
        }

        let mut file = options.open(&self.path).map_err(write_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(self.mode))
                .map_err(write_error)?;
        }

        file.write_all(self.content.as_bytes()).map_err(write_error)?;
        file.sync_all().map_err(write_error)?;
        Ok(())
    }
}

/// Renders config documents to the paths named in [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    gateway_path: PathBuf,
    allocation_path: PathBuf,
    client_dir: PathBuf,
    gateway_network: Ipv4Net,
    client_address: Ipv4Net,
    listen_port: u16,
    dns: String,
    persistent_keepalive: u16,
}

impl ConfigRenderer {
    pub fn new(config: &Config) -> Self {
        Self {
            gateway_path: config.gateway_config_path(),
            allocation_path: config.allocator.config_path.clone(),
            client_dir: config.client.config_dir.clone(),
            gateway_network: config.gateway.address,
            client_address: config.client.address,
            listen_port: config.gateway.listen_port,
            dns: config.client.dns.clone(),
            persistent_keepalive: config.client.persistent_keepalive,
        }
    }

    /// Gateway interface config with a single peer restricted to the
    /// configured client host address.
    pub fn render_gateway_config(
        &self,
        gateway: &GatewayIdentity,
        peer_public_key: &str,
    ) -> Result<RenderedConfigFile> {
        require("gateway private key", &gateway.keypair.private_key)?;
        require("peer public key", peer_public_key)?;

        let content = wireguard::gateway_document(gateway, peer_public_key, self.client_address)
            .map_err(|e| render_error(e.to_string()))?;
        Ok(RenderedConfigFile::secret(self.gateway_path.clone(), content))
    }

    /// Allocation daemon config.
    pub fn render_allocation_config(
        &self,
        cfg: &AllocationServiceConfig,
    ) -> Result<RenderedConfigFile> {
        require("allocation private key", &cfg.private_key)?;
        require("allocation public key", &cfg.public_key)?;
        require("allocation interface", &cfg.interface_name)?;
        if cfg.database_path.as_os_str().is_empty() {
            return Err(render_error("allocation database path is empty"));
        }
        if cfg.peer_limit == 0 {
            return Err(render_error("allocation peer_limit must be greater than 0"));
        }

        let content = allocator::allocation_document(cfg).map_err(|e| render_error(e.to_string()))?;
        Ok(RenderedConfigFile::secret(self.allocation_path.clone(), content))
    }

    /// Client config routing all traffic through the gateway, stored under a
    /// file name derived from the client's public key.
    pub fn render_client_config(
        &self,
        client: &ClientIdentity,
        gateway_public_key: &str,
        gateway_public_endpoint: &str,
    ) -> Result<RenderedConfigFile> {
        require("client private key", &client.keypair.private_key)?;
        require("client public key", &client.keypair.public_key)?;
        require("gateway public key", gateway_public_key)?;
        require("gateway public endpoint", gateway_public_endpoint)?;
        require("client DNS", &self.dns)?;

        let endpoint = format_endpoint(gateway_public_endpoint, self.listen_port).ok_or_else(|| {
            render_error(format!(
                "gateway public endpoint '{}' is not a valid host or host:port",
                gateway_public_endpoint.trim()
            ))
        })?;
        let content = wireguard::ClientDocument {
            client,
            gateway_network: self.gateway_network,
            gateway_public_key,
            endpoint: &endpoint,
            dns: &self.dns,
            persistent_keepalive: self.persistent_keepalive,
        }
        .render()
        .map_err(|e| render_error(e.to_string()))?;

        let path = self
            .client_dir
            .join(format!("{}.conf", key_file_stem(&client.keypair.public_key)));
        Ok(RenderedConfigFile::secret(path, content))
    }
}

/// Reject empty values and values that would break out of their line.
fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(render_error(format!("{} is missing", field)));
    }
    if value.contains(['\n', '\r']) {
        return Err(render_error(format!("{} contains a line break", field)));
    }
    Ok(())
}

fn render_error(message: impl Into<String>) -> GatewayError {
    GatewayError::ConfigRender {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;
    use tempfile::tempdir;

    const GATEWAY_PRIVATE: &str = "aGJxMHVGeHJkZmtyU0dJRkx0dVdMTHRvT0tBWWVaTnc=";
    const GATEWAY_PUBLIC: &str = "R0FURVdBWVBVQkxJQ0tFWTAwMDAwMDAwMDAwMDAwMDA=";
    const CLIENT_PRIVATE: &str = "Y2xpZW50UHJpdmF0ZUtleTAwMDAwMDAwMDAwMDAwMDA=";
    const CLIENT_PUBLIC: &str = "Q0xJRU5UL1BVQitMSUNLRVkwMDAwMDAwMDAwMDAwMDA=";

    fn identities(config: &Config) -> (GatewayIdentity, ClientIdentity) {
        let gateway = GatewayIdentity::new(
            Keypair {
                private_key: GATEWAY_PRIVATE.to_string(),
                public_key: GATEWAY_PUBLIC.to_string(),
            },
            config,
        );
        let client = ClientIdentity::new(
            Keypair {
                private_key: CLIENT_PRIVATE.to_string(),
                public_key: CLIENT_PUBLIC.to_string(),
            },
            config,
        );
        (gateway, client)
    }

    fn line_value<'a>(content: &'a str, key: &str) -> Vec<&'a str> {
        content
            .lines()
            .filter_map(|line| line.strip_prefix(&format!("{} = ", key)))
            .collect()
    }

    #[test]
    fn test_gateway_config_restricts_peer_to_client_host() {
        let config = Config::default();
        let (gateway, client) = identities(&config);
        let rendered = ConfigRenderer::new(&config)
            .render_gateway_config(&gateway, &client.keypair.public_key)
            .unwrap();

        assert_eq!(rendered.path, PathBuf::from("/etc/wireguard/wg0.conf"));
        assert_eq!(line_value(&rendered.content, "AllowedIPs"), vec!["10.0.0.2/32"]);
        assert_eq!(line_value(&rendered.content, "Address"), vec!["10.0.0.1/24"]);
        assert_eq!(line_value(&rendered.content, "ListenPort"), vec!["51820"]);
        assert_eq!(line_value(&rendered.content, "PrivateKey"), vec![GATEWAY_PRIVATE]);
        assert_eq!(line_value(&rendered.content, "PublicKey"), vec![CLIENT_PUBLIC]);
        assert!(rendered.content.find("[Interface]") < rendered.content.find("[Peer]"));
        assert_eq!(rendered.mode, OWNER_ONLY);
    }

    #[test]
    fn test_client_config_points_at_gateway() {
        let config = Config::default();
        let (gateway, client) = identities(&config);
        let rendered = ConfigRenderer::new(&config)
            .render_client_config(&client, &gateway.keypair.public_key, "203.0.113.5")
            .unwrap();

        assert_eq!(line_value(&rendered.content, "Endpoint"), vec!["203.0.113.5:51820"]);
        assert_eq!(line_value(&rendered.content, "PersistentKeepalive"), vec!["25"]);
        assert_eq!(line_value(&rendered.content, "AllowedIPs"), vec!["0.0.0.0/0, ::/0"]);
        assert_eq!(line_value(&rendered.content, "Address"), vec!["10.0.0.2/24"]);
        assert_eq!(line_value(&rendered.content, "DNS"), vec!["1.1.1.1"]);
        assert_eq!(line_value(&rendered.content, "PublicKey"), vec![GATEWAY_PUBLIC]);
        assert_eq!(
            rendered.path,
            PathBuf::from("/etc/wireguard/clients/Q0xJRU5UL1BVQitMSUNLRVkwMDAwMDAwMDAwMDAwMDA.conf")
        );
        assert_eq!(rendered.mode, OWNER_ONLY);
    }

    #[test]
    fn test_client_config_requires_endpoint() {
        let config = Config::default();
        let (gateway, client) = identities(&config);
        let err = ConfigRenderer::new(&config)
            .render_client_config(&client, &gateway.keypair.public_key, "  ")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigRender { .. }));
    }

    #[test]
    fn test_client_config_keeps_hostname_port() {
        let config = Config::default();
        let (gateway, client) = identities(&config);
        let renderer = ConfigRenderer::new(&config);

        let rendered = renderer
            .render_client_config(&client, &gateway.keypair.public_key, "vpn.example.net:443")
            .unwrap();
        assert_eq!(line_value(&rendered.content, "Endpoint"), vec!["vpn.example.net:443"]);

        let err = renderer
            .render_client_config(&client, &gateway.keypair.public_key, "vpn.example.net:https")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigRender { .. }));
    }

    #[test]
    fn test_allocation_config_document() {
        let config = Config::default();
        let (gateway, _) = identities(&config);
        let cfg = AllocationServiceConfig::for_gateway(&gateway, &config);
        let rendered = ConfigRenderer::new(&config)
            .render_allocation_config(&cfg)
            .unwrap();

        assert_eq!(rendered.path, PathBuf::from("/etc/dynamic-wireguard/config.toml"));
        let parsed: toml::Table = toml::from_str(&rendered.content).unwrap();
        assert_eq!(parsed["listen_address"].as_str(), Some("127.0.0.1:5000"));
        assert_eq!(parsed["private_key"].as_str(), Some(GATEWAY_PRIVATE));
        assert_eq!(parsed["public_key"].as_str(), Some(GATEWAY_PUBLIC));
        assert_eq!(parsed["peer_limit"].as_integer(), Some(100));
        assert_eq!(
            parsed["database"].as_str(),
            Some("/var/lib/dynamic-wireguard/peers.db")
        );
        assert_eq!(parsed["interface"].as_str(), Some("wg0"));
    }

    #[test]
    fn test_allocation_config_missing_fields() {
        let config = Config::default();
        let (gateway, _) = identities(&config);
        let renderer = ConfigRenderer::new(&config);

        let mut cfg = AllocationServiceConfig::for_gateway(&gateway, &config);
        cfg.peer_limit = 0;
        assert!(matches!(
            renderer.render_allocation_config(&cfg),
            Err(GatewayError::ConfigRender { .. })
        ));

        let mut cfg = AllocationServiceConfig::for_gateway(&gateway, &config);
        cfg.private_key.clear();
        assert!(renderer.render_allocation_config(&cfg).is_err());

        let mut cfg = AllocationServiceConfig::for_gateway(&gateway, &config);
        cfg.interface_name.clear();
        assert!(renderer.render_allocation_config(&cfg).is_err());
    }

    #[test]
    fn test_gateway_config_rejects_injected_lines() {
        let config = Config::default();
        let (gateway, _) = identities(&config);
        assert!(ConfigRenderer::new(&config)
            .render_gateway_config(&gateway, "abc\nPostUp = rm -rf /")
            .is_err());
    }

    #[test]
    fn test_debug_hides_content() {
        let file = RenderedConfigFile::secret(PathBuf::from("wg0.conf"), "PrivateKey = x".to_string());
        let rendered = format!("{:?}", file);
        assert!(!rendered.contains("PrivateKey"));
        assert!(rendered.contains("600"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("wg0.conf");
        let file = RenderedConfigFile::secret(path.clone(), "[Interface]\n".to_string());
        file.write().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(mode & 0o077, 0, "group/other bits must never be set");
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Interface]\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_narrows_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("client.conf");
        fs::write(&path, "old content that is longer than the new one").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        RenderedConfigFile::secret(path.clone(), "new".to_string())
            .write()
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_creates_owner_only_directories() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let wireguard_dir = temp_dir.path().join("wireguard");
        let clients_dir = wireguard_dir.join("clients");
        RenderedConfigFile::secret(clients_dir.join("client.conf"), "[Interface]\n".to_string())
            .write()
            .unwrap();

        for dir in [&wireguard_dir, &clients_dir] {
            let mode = fs::metadata(dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700, "{} has mode {:o}", dir.display(), mode);
        }
    }

    #[test]
    fn test_write_failure_is_config_write_error() {
        let temp_dir = tempdir().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let file = RenderedConfigFile::secret(blocker.join("wg0.conf"), String::new());
        assert!(matches!(file.write(), Err(GatewayError::ConfigWrite { .. })));
    }
}
