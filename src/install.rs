// SPDX-License-Identifier: AGPL-3.0-or-later
//! System package installation and the allocation daemon binary
//!
//! Packages go to the package manager in a single invocation so it can
//! resolve dependencies as one transaction. The daemon comes from the first
//! source that works: an existing install, a distribution package, or a
//! clone-build-install from its repository.

use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{AllocatorConfig, Config, PackageConfig};
use crate::error::{BuildStep, GatewayError, Result};
use crate::executor::{run_checked, CommandSpec, Executor};

/// Where the allocation daemon binary came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonSource {
    /// Already executable at the configured path
    AlreadyInstalled,
    /// Installed from the named package
    Package(String),
    /// Cloned, built and installed from source
    Built,
}

/// Installs packages and the allocation daemon
pub struct PackageInstaller<'a, E: Executor + ?Sized> {
    executor: &'a E,
    packages: &'a PackageConfig,
    allocator: &'a AllocatorConfig,
}

impl<'a, E: Executor + ?Sized> PackageInstaller<'a, E> {
    /// Create a new installer
    pub fn new(executor: &'a E, config: &'a Config) -> Self {
        Self {
            executor,
            packages: &config.packages,
            allocator: &config.allocator,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.packages.timeout_secs)
    }

    fn manager(&self) -> CommandSpec {
        CommandSpec::new(&self.packages.manager)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .timeout(self.timeout())
    }

    /// Install `names` with one package manager invocation.
    ///
    /// Any non-zero exit fails the whole call; there is no partial success.
    pub async fn install(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }

        if self.packages.refresh_index {
            info!(manager = %self.packages.manager, "Refreshing package index");
            run_checked(self.executor, &self.manager().args(["update", "-y"]))
                .await
                .map_err(|message| GatewayError::Install { message })?;
        }

        info!(packages = %names.join(" "), "Installing packages");
        let spec = self.manager().args(["install", "-y"]).args(names.iter().cloned());
        run_checked(self.executor, &spec)
            .await
            .map_err(|message| GatewayError::Install { message })?;

        Ok(())
    }

    /// Make sure the allocation daemon binary is installed.
    pub async fn ensure_daemon(&self) -> Result<DaemonSource> {
        let binary = self.allocator.binary.display().to_string();

        let probe = CommandSpec::new("test").args(["-x", binary.as_str()]);
        if run_checked(self.executor, &probe).await.is_ok() {
            info!(binary = %binary, "Allocation daemon already installed");
            return Ok(DaemonSource::AlreadyInstalled);
        }

        if let Some(package) = &self.allocator.package {
            if self.package_available(package).await {
                info!(package = %package, "Installing allocation daemon package");
                self.install(std::slice::from_ref(package)).await?;
                return Ok(DaemonSource::Package(package.clone()));
            }
            warn!(package = %package, "Daemon package not available, building from source");
        } else {
            info!("No daemon package configured, building from source");
        }

        self.build_from_source().await?;
        Ok(DaemonSource::Built)
    }

    async fn package_available(&self, package: &str) -> bool {
        let spec = CommandSpec::new(&self.packages.query)
            .args(["show", package])
            .timeout(self.timeout());
        run_checked(self.executor, &spec).await.is_ok()
    }

    async fn build_from_source(&self) -> Result<()> {
        let build_dir = &self.allocator.build_dir;
        let checkout = build_dir.display().to_string();

        if build_dir.exists() {
            self.verify_checkout().await?;
            self.build_step(
                BuildStep::Clone,
                CommandSpec::new("git").args(["-C", checkout.as_str(), "pull", "--ff-only"]),
            )
            .await?;
        } else {
            self.build_step(
                BuildStep::Clone,
                CommandSpec::new("git").args([
                    "clone",
                    "--depth",
                    "1",
                    self.allocator.repository.as_str(),
                    checkout.as_str(),
                ]),
            )
            .await?;
        }

        self.build_step(
            BuildStep::Compile,
            CommandSpec::new("cargo")
                .args(["build", "--release"])
                .cwd(build_dir),
        )
        .await?;

        let artifact = build_dir.join(&self.allocator.build_artifact);
        self.build_step(
            BuildStep::Install,
            CommandSpec::new("install").args([
                "-D".to_string(),
                "-m".to_string(),
                "0755".to_string(),
                artifact.display().to_string(),
                self.allocator.binary.display().to_string(),
            ]),
        )
        .await?;

        info!(binary = %self.allocator.binary.display(), "Allocation daemon built and installed");
        Ok(())
    }

    /// An existing `build_dir` is only reused when it is the top level of a
    /// git work tree; anything else is left untouched and the build stops.
    async fn verify_checkout(&self) -> Result<()> {
        let build_dir = &self.allocator.build_dir;
        let checkout = build_dir.display().to_string();
        let spec = CommandSpec::new("git").args(["-C", checkout.as_str(), "rev-parse", "--show-toplevel"]);

        let toplevel = run_checked(self.executor, &spec).await.map_err(|message| {
            build_error(
                BuildStep::Clone,
                format!("{} exists and is not a git checkout: {}", checkout, message),
            )
        })?;

        let toplevel = Path::new(toplevel.trim());
        let is_root = toplevel == build_dir.as_path()
            || build_dir
                .canonicalize()
                .map(|dir| dir == toplevel)
                .unwrap_or(false);
        if !is_root {
            return Err(build_error(
                BuildStep::Clone,
                format!(
                    "{} exists inside the checkout at {} rather than being one",
                    checkout,
                    toplevel.display()
                ),
            ));
        }

        info!(build_dir = %checkout, "Reusing existing daemon checkout");
        Ok(())
    }

    async fn build_step(&self, step: BuildStep, spec: CommandSpec) -> Result<()> {
        info!(step = %step, command = %spec, "Daemon build step");
        let spec = spec.timeout(self.timeout());
        match run_checked(self.executor, &spec).await {
            Ok(_) => Ok(()),
            Err(message) => {
                error!(step = %step, error = %message, "Daemon build step failed");
                Err(build_error(step, message))
            }
        }
    }
}

fn build_error(step: BuildStep, message: String) -> GatewayError {
    GatewayError::Build { step, message }
}
