use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleetpolicy_store::default_state_root;
use fleetpolicy_upgrade::{UpgradeOptions, DEFAULT_CONCURRENCY};
use serde::Deserialize;

const CONFIG_FILE_NAME: &str = "config.toml";
const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CliConfig {
    pub(crate) version: u32,
    #[serde(default = "default_concurrency")]
    pub(crate) concurrency: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

pub(crate) fn resolve_state_root(requested: Option<&Path>) -> Result<PathBuf> {
    match requested {
        Some(root) => Ok(root.to_path_buf()),
        None => default_state_root(),
    }
}

pub(crate) fn config_path(state_root: &Path) -> PathBuf {
    state_root.join(CONFIG_FILE_NAME)
}

/// Reads `<state_root>/config.toml`, falling back to defaults when it is absent.
pub(crate) fn load_config(state_root: &Path) -> Result<CliConfig> {
    let path = config_path(state_root);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CliConfig::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file: {}", path.display()));
        }
    };
    parse_config(&raw).with_context(|| format!("failed to load config file: {}", path.display()))
}

pub(crate) fn parse_config(raw: &str) -> Result<CliConfig> {
    let config: CliConfig = toml::from_str(raw).context("failed to parse fleetpolicy config")?;
    if config.version != SUPPORTED_CONFIG_VERSION {
        anyhow::bail!(
            "unsupported config version {} (expected {SUPPORTED_CONFIG_VERSION}); rewrite the file or remove it to use defaults",
            config.version
        );
    }
    if config.concurrency == 0 {
        anyhow::bail!("concurrency must be at least 1");
    }
    Ok(config)
}

pub(crate) fn resolve_upgrade_options(
    config: &CliConfig,
    concurrency_override: Option<usize>,
) -> Result<UpgradeOptions> {
    let concurrency = concurrency_override.unwrap_or(config.concurrency);
    if concurrency == 0 {
        anyhow::bail!("--concurrency must be at least 1");
    }
    Ok(UpgradeOptions { concurrency })
}
