// SPDX-License-Identifier: AGPL-3.0-or-later
//! TOML document for the peer-allocation daemon

use crate::identity::AllocationServiceConfig;

pub(super) fn allocation_document(cfg: &AllocationServiceConfig) -> Result<String, toml::ser::Error> {
    let body = toml::to_string_pretty(cfg)?;
    Ok(format!("{}\n{}", super::HEADER, body))
}
