use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleetpolicy_core::{
    current_unix_timestamp, validate_package_name, Installation, InstallationRegistry,
};

mod receipt;

pub use receipt::InstallationRecord;
use receipt::{parse_record, serialize_record};

/// Installation registry kept as one `<name>.receipt` file per package under
/// `<state_root>/installations`.
#[derive(Debug, Clone)]
pub struct FileInstallationRegistry {
    state_root: PathBuf,
}

impl FileInstallationRegistry {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn installations_dir(&self) -> PathBuf {
        self.state_root.join("installations")
    }

    pub fn receipt_path(&self, name: &str) -> PathBuf {
        self.installations_dir().join(format!("{name}.receipt"))
    }

    /// Records `installation`, replacing any previous record for the same package.
    pub fn record(&self, installation: &Installation) -> Result<PathBuf> {
        validate_package_name(&installation.name)?;
        let record = InstallationRecord {
            installation: installation.clone(),
            installed_at_unix: current_unix_timestamp()?,
        };
        self.write_record(&record)
    }

    pub fn read_record(&self, name: &str) -> Result<Option<InstallationRecord>> {
        validate_package_name(name)?;
        let path = self.receipt_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read installation receipt: {}", path.display())
                });
            }
        };

        let record = parse_record(&raw)
            .with_context(|| format!("failed to parse installation receipt: {}", path.display()))?;
        if record.installation.name != name {
            anyhow::bail!(
                "installation receipt {} names package '{}' (expected '{}')",
                path.display(),
                record.installation.name,
                name
            );
        }
        Ok(Some(record))
    }

    pub fn list(&self) -> Result<Vec<InstallationRecord>> {
        let dir = self.installations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| {
            format!(
                "failed to read installation state directory: {}",
                dir.display()
            )
        })? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
                continue;
            }

            let raw = fs::read_to_string(&path).with_context(|| {
                format!("failed to read installation receipt: {}", path.display())
            })?;
            let record = parse_record(&raw).with_context(|| {
                format!("failed to parse installation receipt: {}", path.display())
            })?;
            records.push(record);
        }

        records.sort_by(|a, b| a.installation.name.cmp(&b.installation.name));
        Ok(records)
    }

    /// Flips the auto-upgrade flag of an installed package. Returns `false` when
    /// the package is not installed.
    pub fn set_keep_policies_up_to_date(&self, name: &str, enabled: bool) -> Result<bool> {
        let Some(mut record) = self.read_record(name)? else {
            return Ok(false);
        };
        record.installation.keep_policies_up_to_date = enabled;
        self.write_record(&record)?;
        Ok(true)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        validate_package_name(name)?;
        let path = self.receipt_path(name);
        if !path.exists() {
            return Ok(false);
        }

        fs::remove_file(&path)
            .with_context(|| format!("failed to remove installation receipt: {}", path.display()))?;
        Ok(true)
    }

    fn write_record(&self, record: &InstallationRecord) -> Result<PathBuf> {
        let dir = self.installations_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create installation dir: {}", dir.display()))?;

        let path = self.receipt_path(&record.installation.name);
        fs::write(&path, serialize_record(record).as_bytes())
            .with_context(|| format!("failed to write installation receipt: {}", path.display()))?;
        Ok(path)
    }
}

impl InstallationRegistry for FileInstallationRegistry {
    fn get(&self, package_name: &str) -> Result<Option<Installation>> {
        Ok(self
            .read_record(package_name)?
            .map(|record| record.installation))
    }
}
