// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning driver
//!
//! Runs the provisioning steps in a fixed order. Each step consumes the
//! previous step's output; the first failure ends the run in
//! [`ProvisionState::Failed`] and nothing after it executes.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::executor::{run_checked, CommandSpec, Executor, ProcessHandle};
use crate::identity::{AllocationServiceConfig, ClientIdentity, GatewayIdentity};
use crate::install::{DaemonSource, PackageInstaller};
use crate::keys::generate_keypair;
use crate::render::ConfigRenderer;
use crate::services::ServiceOrchestrator;

/// A transition of the provisioning state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PrivilegeCheck,
    PackageInstall,
    DaemonBuild,
    KeyGeneration,
    ConfigRender,
    DaemonStart,
    Forwarding,
    ServiceRestart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PrivilegeCheck => "privilege-check",
            Stage::PackageInstall => "package-install",
            Stage::DaemonBuild => "daemon-build",
            Stage::KeyGeneration => "key-generation",
            Stage::ConfigRender => "config-render",
            Stage::DaemonStart => "daemon-start",
            Stage::Forwarding => "ip-forwarding",
            Stage::ServiceRestart => "service-restart",
        };
        f.write_str(name)
    }
}

/// Where a provisioning run stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionState {
    NotStarted,
    PrivilegeChecked,
    PackagesInstalled,
    DaemonBuilt,
    KeysGenerated,
    ConfigsRendered,
    DaemonStarted,
    ForwardingEnabled,
    ServiceRestarted,
    Complete,
    Failed { stage: Stage, cause: String },
}

impl ProvisionState {
    /// The stage that leaves this state, if any
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            ProvisionState::NotStarted => Some(Stage::PrivilegeCheck),
            ProvisionState::PrivilegeChecked => Some(Stage::PackageInstall),
            ProvisionState::PackagesInstalled => Some(Stage::DaemonBuild),
            ProvisionState::DaemonBuilt => Some(Stage::KeyGeneration),
            ProvisionState::KeysGenerated => Some(Stage::ConfigRender),
            ProvisionState::ConfigsRendered => Some(Stage::DaemonStart),
            ProvisionState::DaemonStarted => Some(Stage::Forwarding),
            ProvisionState::ForwardingEnabled => Some(Stage::ServiceRestart),
            // the last transition only records completion and cannot fail
            ProvisionState::ServiceRestarted
            | ProvisionState::Complete
            | ProvisionState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Complete | ProvisionState::Failed { .. })
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub gateway_public_key: String,
    pub client_public_key: String,
    pub daemon_source: DaemonSource,
    pub gateway_config: PathBuf,
    pub allocation_config: PathBuf,
    pub client_config: PathBuf,
    pub daemon: ProcessHandle,
}

/// Sequences a provisioning run
pub struct Driver<'a, E: Executor + ?Sized> {
    config: &'a Config,
    executor: &'a E,
    state: ProvisionState,
}

impl<'a, E: Executor + ?Sized> Driver<'a, E> {
    /// Create a new driver
    pub fn new(config: &'a Config, executor: &'a E) -> Self {
        Self {
            config,
            executor,
            state: ProvisionState::NotStarted,
        }
    }

    pub fn state(&self) -> &ProvisionState {
        &self.state
    }

    /// Run every step once, in order.
    ///
    /// A driver runs at most once; calling this again after the run reached
    /// `Complete` or `Failed` returns an error and executes nothing.
    pub async fn run(&mut self) -> Result<Provisioned> {
        if self.state.is_terminal() {
            return Err(GatewayError::AlreadyFinished {
                state: format!("{:?}", self.state),
            });
        }

        let start_time = Instant::now();
        info!("Starting gateway provisioning");

        match self.execute().await {
            Ok(provisioned) => {
                self.advance(ProvisionState::Complete);
                info!(
                    duration_ms = start_time.elapsed().as_millis() as u64,
                    gateway_public_key = %provisioned.gateway_public_key,
                    client_config = %provisioned.client_config.display(),
                    "Gateway provisioning complete"
                );
                Ok(provisioned)
            }
            Err(err) => {
                // a failure always happens while leaving a non-terminal state
                let stage = self.state.next_stage().unwrap_or(Stage::ServiceRestart);
                error!(stage = %stage, error = %err, "Provisioning failed");
                self.state = ProvisionState::Failed {
                    stage,
                    cause: err.to_string(),
                };
                Err(err)
            }
        }
    }

    fn advance(&mut self, next: ProvisionState) {
        info!(from = ?self.state, to = ?next, "Provisioning state changed");
        self.state = next;
    }

    async fn execute(&mut self) -> Result<Provisioned> {
        let config = self.config;
        let executor = self.executor;

        if !executor.is_privileged() {
            return Err(GatewayError::Privilege {
                message: "provisioning must run as root".to_string(),
            });
        }
        self.advance(ProvisionState::PrivilegeChecked);

        let installer = PackageInstaller::new(executor, config);
        installer.install(&config.packages.names).await?;
        self.advance(ProvisionState::PackagesInstalled);

        let daemon_source = installer.ensure_daemon().await?;
        self.advance(ProvisionState::DaemonBuilt);

        info!("Generating gateway keypair");
        let gateway = GatewayIdentity::new(generate_keypair(executor).await?, config);
        info!("Generating client keypair");
        let client = ClientIdentity::new(generate_keypair(executor).await?, config);
        info!(
            gateway_public_key = %gateway.keypair.public_key,
            client_public_key = %client.keypair.public_key,
            "Keypairs generated"
        );
        self.advance(ProvisionState::KeysGenerated);

        let endpoint = self.public_endpoint().await?;
        let renderer = ConfigRenderer::new(config);
        let allocation = AllocationServiceConfig::for_gateway(&gateway, config);
        let files = [
            renderer.render_gateway_config(&gateway, &client.keypair.public_key)?,
            renderer.render_allocation_config(&allocation)?,
            renderer.render_client_config(&client, &gateway.keypair.public_key, &endpoint)?,
        ];
        for file in &files {
            file.write()?;
            info!(path = %file.path.display(), mode = %format!("{:o}", file.mode), "Wrote config");
        }
        let [gateway_file, allocation_file, client_file] = files;
        self.advance(ProvisionState::ConfigsRendered);

        let services = ServiceOrchestrator::new(executor, config);
        let daemon = services
            .start_allocation_daemon(&allocation_file.path)
            .await?;
        self.advance(ProvisionState::DaemonStarted);

        services.enable_ip_forwarding().await?;
        self.advance(ProvisionState::ForwardingEnabled);

        services.restart_gateway_service().await?;
        self.advance(ProvisionState::ServiceRestarted);

        Ok(Provisioned {
            gateway_public_key: gateway.keypair.public_key,
            client_public_key: client.keypair.public_key,
            daemon_source,
            gateway_config: gateway_file.path,
            allocation_config: allocation_file.path,
            client_config: client_file.path,
            daemon,
        })
    }

    /// Configured endpoint, or the host's first address as reported by
    /// `hostname -I`.
    async fn public_endpoint(&self) -> Result<String> {
        if let Some(endpoint) = &self.config.gateway.public_endpoint {
            return Ok(endpoint.clone());
        }

        let stdout = run_checked(self.executor, &CommandSpec::new("hostname").arg("-I"))
            .await
            .map_err(|message| GatewayError::ConfigRender {
                message: format!("public endpoint not configured and discovery failed: {}", message),
            })?;

        let endpoint = stdout
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::ConfigRender {
                message: "public endpoint not configured and the host reports no address".to_string(),
            })?;
        info!(endpoint = %endpoint, "Discovered public endpoint");
        Ok(endpoint)
    }
}
