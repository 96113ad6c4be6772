//! CLI configuration loading and merging.

use std::path::Path;

use anyhow::{Context, Result};
use tessera_stream::StreamConfig;

/// Load and merge CLI configuration.
///
/// Configuration precedence:
/// 1. CLI arguments (applied by each command)
/// 2. Environment variables
/// 3. File passed with `--config`
/// 4. Local config file (./.tesserarc)
/// 5. Global config file (~/.tessera/config.toml)
/// 6. Defaults
pub fn load(explicit: Option<&Path>) -> Result<StreamConfig> {
    let mut config = StreamConfig::discover_and_load().context("Failed to load configuration")?;
    if let Some(path) = explicit {
        let layer = StreamConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.merge(&layer);
    }
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}
