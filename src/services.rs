// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocation daemon launch, kernel forwarding and gateway service control

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::executor::{run_checked, CommandSpec, Executor, ProcessHandle};

/// sysctl key controlling IPv4 forwarding
pub const FORWARDING_KEY: &str = "net.ipv4.ip_forward";

/// Persisted form of the forwarding setting
pub const FORWARDING_LINE: &str = "net.ipv4.ip_forward=1";

/// Interval between readiness probes of the daemon listener
const READINESS_POLL: Duration = Duration::from_millis(200);

/// Starts the daemon, enables forwarding and bounces the gateway service
pub struct ServiceOrchestrator<'a, E: Executor + ?Sized> {
    executor: &'a E,
    config: &'a Config,
}

impl<'a, E: Executor + ?Sized> ServiceOrchestrator<'a, E> {
    /// Create a new orchestrator
    pub fn new(executor: &'a E, config: &'a Config) -> Self {
        Self { executor, config }
    }

    /// Launch the allocation daemon in the background and wait until its
    /// listener accepts connections.
    pub async fn start_allocation_daemon(&self, config_path: &Path) -> Result<ProcessHandle> {
        let allocator = &self.config.allocator;
        let config_arg = config_path.display().to_string();
        let spec = CommandSpec::new(allocator.binary.display().to_string()).args(
            allocator
                .args
                .iter()
                .map(|arg| arg.replace("{config}", &config_arg)),
        );

        info!(command = %spec, "Starting allocation daemon");
        let handle = self
            .executor
            .spawn_detached(&spec)
            .await
            .map_err(|e| GatewayError::ServiceStart {
                message: format!("`{}` could not be spawned: {}", spec, e),
            })?;
        info!(pid = handle.pid, "Allocation daemon spawned");

        if allocator.readiness_timeout_secs == 0 {
            debug!("Readiness check disabled");
            return Ok(handle);
        }

        let limit = Duration::from_secs(allocator.readiness_timeout_secs);
        wait_for_listener(allocator.listen_address, limit)
            .await
            .map_err(|message| GatewayError::ServiceStart { message })?;
        info!(listen_address = %allocator.listen_address, "Allocation daemon is ready");

        Ok(handle)
    }

    /// Enable IPv4 forwarding now and on every boot. Safe to repeat.
    pub async fn enable_ip_forwarding(&self) -> Result<()> {
        info!("Enabling IP forwarding");
        let spec = CommandSpec::new("sysctl").args(["-w", FORWARDING_LINE]);
        run_checked(self.executor, &spec)
            .await
            .map_err(|message| GatewayError::Forwarding { message })?;

        let path = &self.config.forwarding.sysctl_conf;
        let changed = persist_forwarding(path).map_err(|e| GatewayError::Forwarding {
            message: format!("failed to persist to {}: {}", path.display(), e),
        })?;
        if changed {
            info!(path = %path.display(), "Persisted forwarding setting");
        } else {
            debug!(path = %path.display(), "Forwarding setting already persisted");
        }

        Ok(())
    }

    /// Restart the gateway interface unit with the freshly rendered config.
    pub async fn restart_gateway_service(&self) -> Result<()> {
        let service = &self.config.service;
        let unit = self.config.service_unit();

        if service.enable_on_boot {
            info!(unit = %unit, "Enabling gateway service");
            let spec = CommandSpec::new(&service.manager).args(["enable", unit.as_str()]);
            run_checked(self.executor, &spec)
                .await
                .map_err(|message| GatewayError::ServiceRestart { message })?;
        }

        info!(unit = %unit, "Restarting gateway service");
        let spec = CommandSpec::new(&service.manager).args(["restart", unit.as_str()]);
        run_checked(self.executor, &spec)
            .await
            .map_err(|message| GatewayError::ServiceRestart { message })?;

        Ok(())
    }
}

/// Poll `addr` until a TCP connect succeeds or `limit` elapses.
pub async fn wait_for_listener(addr: SocketAddr, limit: Duration) -> std::result::Result<(), String> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!(
                "no listener on {} after {} seconds",
                addr,
                limit.as_secs()
            ));
        }

        match timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => debug!(addr = %addr, error = %e, "Daemon not ready yet"),
            Err(_) => continue,
        }

        sleep(READINESS_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Ensure the sysctl file enables forwarding exactly once.
///
/// Returns whether the file was changed.
pub fn persist_forwarding(path: &Path) -> std::io::Result<bool> {
    let existing = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    match apply_forwarding_line(&existing) {
        Some(updated) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, updated)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Rewrite sysctl file contents so forwarding is enabled by exactly one
/// active line. The first active assignment is replaced in place and later
/// ones are dropped; comments are left alone. `None` means no change.
pub fn apply_forwarding_line(contents: &str) -> Option<String> {
    let mut out = Vec::new();
    let mut seen = false;
    let mut changed = false;

    for line in contents.lines() {
        if !is_forwarding_assignment(line) {
            out.push(line.to_string());
            continue;
        }

        if seen {
            changed = true;
            continue;
        }

        seen = true;
        if line.trim() != FORWARDING_LINE {
            changed = true;
        }
        out.push(FORWARDING_LINE.to_string());
    }

    if !seen {
        out.push(FORWARDING_LINE.to_string());
        changed = true;
    }

    if !changed {
        return None;
    }

    let mut updated = out.join("\n");
    updated.push('\n');
    Some(updated)
}

fn is_forwarding_assignment(line: &str) -> bool {
    let line = line.trim();
    if line.starts_with('#') || line.starts_with(';') {
        return false;
    }
    line.split_once('=')
        .map(|(key, _)| key.trim() == FORWARDING_KEY)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_apply_appends_when_missing() {
        let updated = apply_forwarding_line("kernel.panic=10\n").unwrap();
        assert_eq!(updated, "kernel.panic=10\nnet.ipv4.ip_forward=1\n");
    }

    #[test]
    fn test_apply_to_empty_file() {
        assert_eq!(apply_forwarding_line("").unwrap(), "net.ipv4.ip_forward=1\n");
    }

    #[test]
    fn test_apply_leaves_correct_file_alone() {
        assert!(apply_forwarding_line("# router\nnet.ipv4.ip_forward=1\n").is_none());
    }

    #[test]
    fn test_apply_rewrites_disabled_setting_in_place() {
        let updated = apply_forwarding_line("a=1\nnet.ipv4.ip_forward = 0\nb=2\n").unwrap();
        assert_eq!(updated, "a=1\nnet.ipv4.ip_forward=1\nb=2\n");
    }

    #[test]
    fn test_apply_ignores_commented_line() {
        let updated = apply_forwarding_line("#net.ipv4.ip_forward=1\n").unwrap();
        assert_eq!(updated, "#net.ipv4.ip_forward=1\nnet.ipv4.ip_forward=1\n");
    }

    #[test]
    fn test_apply_drops_duplicates() {
        let updated =
            apply_forwarding_line("net.ipv4.ip_forward=1\nnet.ipv4.ip_forward=1\n").unwrap();
        assert_eq!(updated, "net.ipv4.ip_forward=1\n");
    }

    #[test]
    fn test_persist_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sysctl.conf");
        std::fs::write(&path, "vm.swappiness=10\n").unwrap();

        assert!(persist_forwarding(&path).unwrap());
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(!persist_forwarding(&path).unwrap());
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.matches(FORWARDING_LINE).count(), 1);
    }

    #[test]
    fn test_persist_creates_missing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sysctl.d").join("99-wireguard.conf");
        assert!(persist_forwarding(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "net.ipv4.ip_forward=1\n");
    }

    #[tokio::test]
    async fn test_wait_for_listener_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(wait_for_listener(addr, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_listener_times_out() {
        // bind then drop to get a port nothing listens on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = wait_for_listener(addr, Duration::from_millis(500)).await.unwrap_err();
        assert!(err.contains(&addr.to_string()));
    }
}
