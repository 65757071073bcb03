// SPDX-License-Identifier: AGPL-3.0-or-later
//! wg-provision: one-shot provisioning for a WireGuard gateway host
//!
//! A run installs the required packages, makes sure the peer-allocation
//! daemon is present, generates the gateway and client keypairs, renders the
//! gateway, allocation daemon and client configs, starts the daemon, enables
//! IP forwarding and restarts the gateway interface service.
//!
//! # Features
//!
//! * **Fail-stop sequencing:** The first failing step ends the run; nothing
//!   after it executes
//! * **Scriptable host access:** Every external tool is reached through the
//!   [`executor::Executor`] trait
//! * **Owner-only secrets:** Every rendered file carrying a private key is
//!   written with mode 600

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod identity;
pub mod install;
pub mod keys;
pub mod render;
pub mod services;

pub use config::Config;
pub use driver::{Driver, ProvisionState, Provisioned, Stage};
pub use error::{GatewayError, Result};
