// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted executor shared by the integration tests

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use wg_provision::executor::{CommandOutput, CommandSpec, Executor, ProcessHandle};
use wg_provision::Config;
use x25519_dalek::{PublicKey, StaticSecret};

/// Executor that records every call and answers from a script.
///
/// `wg genkey` returns a fresh deterministic key, `wg pubkey` performs the
/// real Curve25519 derivation, commands matching a failure prefix exit 1,
/// and everything else succeeds with empty output.
pub struct FakeExecutor {
    pub privileged: bool,
    failures: Vec<String>,
    outputs: Vec<(String, String)>,
    calls: Mutex<Vec<String>>,
    spawned: Mutex<Vec<String>>,
    next_key: AtomicU8,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            privileged: true,
            failures: Vec::new(),
            outputs: vec![("hostname -I".to_string(), "203.0.113.5 10.0.0.1\n".to_string())],
            calls: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            next_key: AtomicU8::new(1),
        }
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    /// Make every command whose line starts with `prefix` exit 1
    pub fn failing(mut self, prefix: &str) -> Self {
        self.failures.push(prefix.to_string());
        self
    }

    /// Answer commands whose line starts with `prefix` with `stdout`
    pub fn output(mut self, prefix: &str, stdout: &str) -> Self {
        self.outputs.insert(0, (prefix.to_string(), stdout.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|line| line.starts_with(prefix))
    }

    fn fresh_private_key(&self) -> String {
        let seed = self.next_key.fetch_add(1, Ordering::SeqCst);
        let secret = StaticSecret::from([seed; 32]);
        general_purpose::STANDARD.encode(secret.to_bytes())
    }
}

/// Reference derivation used to check `wg pubkey` results
pub fn derive(private_key: &str) -> String {
    let bytes = general_purpose::STANDARD.decode(private_key.trim()).unwrap();
    let bytes: [u8; 32] = bytes.try_into().unwrap();
    let public = PublicKey::from(&StaticSecret::from(bytes));
    general_purpose::STANDARD.encode(public.as_bytes())
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn run(&self, command: &CommandSpec) -> io::Result<CommandOutput> {
        let line = command.to_string();
        self.calls.lock().unwrap().push(line.clone());

        if self.failures.iter().any(|prefix| line.starts_with(prefix)) {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "scripted failure".to_string(),
            });
        }

        if let Some((_, stdout)) = self.outputs.iter().find(|(prefix, _)| line.starts_with(prefix)) {
            return Ok(CommandOutput {
                status: Some(0),
                stdout: stdout.clone(),
                stderr: String::new(),
            });
        }

        let stdout = match line.as_str() {
            "wg genkey" => format!("{}\n", self.fresh_private_key()),
            "wg pubkey" => format!("{}\n", derive(command.stdin.as_deref().unwrap_or_default())),
            _ => String::new(),
        };

        Ok(CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    async fn spawn_detached(&self, command: &CommandSpec) -> io::Result<ProcessHandle> {
        let line = command.to_string();
        self.spawned.lock().unwrap().push(line.clone());

        if self.failures.iter().any(|prefix| line.starts_with(prefix)) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "scripted failure"));
        }

        Ok(ProcessHandle {
            pid: 4242,
            program: command.program.clone(),
        })
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}

/// Configuration with every host path redirected under `root`
pub fn sandbox_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.gateway.config_dir = root.join("wireguard");
    config.gateway.public_endpoint = Some("203.0.113.5".to_string());
    config.client.config_dir = root.join("wireguard").join("clients");
    config.allocator.config_path = root.join("dynamic-wireguard").join("config.toml");
    config.allocator.database = root.join("lib").join("peers.db");
    config.allocator.binary = root.join("bin").join("dynamic-wireguard");
    config.allocator.build_dir = root.join("src").join("dynamic-wireguard");
    config.allocator.readiness_timeout_secs = 0;
    config.forwarding.sysctl_conf = root.join("sysctl.conf");
    config
}
