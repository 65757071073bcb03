// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for wg-provision

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The three independently failing steps of a source build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Clone,
    Compile,
    Install,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStep::Clone => "clone",
            BuildStep::Compile => "compile",
            BuildStep::Install => "install",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while provisioning the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The run lacks root privileges
    #[error("Insufficient privileges: {message}")]
    Privilege { message: String },

    /// The package manager reported a failure
    #[error("Package installation failed: {message}")]
    Install { message: String },

    /// Building the allocation daemon from source failed
    #[error("Daemon build failed during {step}: {message}")]
    Build { step: BuildStep, message: String },

    /// Keypair generation or derivation failed
    #[error("Key generation failed: {message}")]
    KeyGen { message: String },

    /// A config document could not be rendered
    #[error("Failed to render config: {message}")]
    ConfigRender { message: String },

    /// A rendered config could not be written to disk
    #[error("Failed to write config {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The allocation daemon could not be started or never became ready
    #[error("Allocation daemon failed to start: {message}")]
    ServiceStart { message: String },

    /// IP forwarding could not be enabled or persisted
    #[error("Failed to enable IP forwarding: {message}")]
    Forwarding { message: String },

    /// The service manager failed to restart the gateway interface
    #[error("Gateway service restart failed: {message}")]
    ServiceRestart { message: String },

    /// The driver already finished a run
    #[error("Provisioning run already finished in state {state}")]
    AlreadyFinished { state: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
}
