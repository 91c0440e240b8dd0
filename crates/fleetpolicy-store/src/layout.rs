use anyhow::{Context, Result};
use fleetpolicy_core::PolicyId;
use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policies_dir(&self) -> PathBuf {
        self.root.join("policies")
    }

    pub fn policy_path(&self, id: &PolicyId) -> PathBuf {
        self.policies_dir().join(format!("{id}.json"))
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.packages_dir().join(name)
    }

    pub fn template_path(&self, name: &str, version: &Version) -> PathBuf {
        self.package_dir(name).join(format!("{version}.toml"))
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_active_path(&self) -> PathBuf {
        self.transactions_dir().join("active")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }

    pub fn staged_policy_path(&self, txid: &str, id: &PolicyId) -> PathBuf {
        self.transaction_staging_path(txid).join(format!("{id}.json"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.policies_dir(),
            self.packages_dir(),
            self.transactions_dir(),
            self.transactions_staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_state_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows state root")?;
        return Ok(PathBuf::from(app_data).join("Fleetpolicy"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve state root")?;
    Ok(PathBuf::from(home).join(".fleetpolicy"))
}

/// Policy ids become file names, so they are limited to a path-safe alphabet.
pub fn validate_policy_id(id: &PolicyId) -> Result<()> {
    let value = id.as_str();
    if value.is_empty() || value.len() > 128 {
        anyhow::bail!("invalid policy id: must be 1-128 characters");
    }
    if value.starts_with('.') {
        anyhow::bail!("invalid policy id: '{value}' must not start with '.'");
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        anyhow::bail!("invalid policy id: '{value}'");
    }
    Ok(())
}
