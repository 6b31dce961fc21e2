//! Configuration loading (spec §10.2). The schema itself lives in
//! `gatehouse-protocol` since the wire layer and the config layer share the
//! same `serde`/`toml` dependency; this module only owns the filesystem side.

use std::path::Path;

use anyhow::{Context, Result};
use gatehouse_protocol::GatewayConfig;

/// Load configuration from a TOML file at the given path. A missing file is
/// not an error — the gateway starts with defaults and logs a warning, since
/// every field already has a sensible default (see `gatehouse_protocol::config`).
pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    if !path.exists() {
        tracing::warn!(
            "config file not found at {}, using defaults",
            path.display()
        );
        return Ok(GatewayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: GatewayConfig =
        toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;

    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}
