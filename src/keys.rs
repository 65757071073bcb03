// SPDX-License-Identifier: AGPL-3.0-or-later
//! WireGuard keypair generation through the `wg` tool

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::executor::{run_checked, CommandSpec, Executor};

/// Raw Curve25519 key length
pub const KEY_LENGTH: usize = 32;

/// Base64-encoded private/public key pair
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a fresh keypair: `wg genkey`, then `wg pubkey` on the result.
pub async fn generate_keypair<E>(executor: &E) -> Result<Keypair>
where
    E: Executor + ?Sized,
{
    let stdout = run_checked(executor, &CommandSpec::new("wg").arg("genkey"))
        .await
        .map_err(keygen_error)?;
    let private_key = stdout.trim().to_string();
    validate_key_b64(&private_key).map_err(|message| keygen_error(format!("wg genkey: {}", message)))?;

    let public_key = derive_public_key(executor, &private_key).await?;
    debug!(public_key = %public_key, "Generated keypair");

    Ok(Keypair {
        private_key,
        public_key,
    })
}

/// Derive the public key for `private_key` with `wg pubkey`.
pub async fn derive_public_key<E>(executor: &E, private_key: &str) -> Result<String>
where
    E: Executor + ?Sized,
{
    let spec = CommandSpec::new("wg")
        .arg("pubkey")
        .stdin(format!("{}\n", private_key));
    let stdout = run_checked(executor, &spec).await.map_err(keygen_error)?;
    let public_key = stdout.trim().to_string();
    validate_key_b64(&public_key).map_err(|message| keygen_error(format!("wg pubkey: {}", message)))?;
    Ok(public_key)
}

/// Check that `key` is base64 for exactly [`KEY_LENGTH`] bytes.
pub fn validate_key_b64(key: &str) -> std::result::Result<(), String> {
    if key.is_empty() {
        return Err("empty key".to_string());
    }
    let bytes = general_purpose::STANDARD
        .decode(key)
        .map_err(|e| format!("not valid base64: {}", e))?;
    if bytes.len() != KEY_LENGTH {
        return Err(format!(
            "expected {} key bytes, got {}",
            KEY_LENGTH,
            bytes.len()
        ));
    }
    Ok(())
}

fn keygen_error(message: String) -> GatewayError {
    GatewayError::KeyGen { message }
}
