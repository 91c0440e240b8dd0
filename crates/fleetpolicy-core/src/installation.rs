use anyhow::Result;
use semver::Version;
use serde::{Deserialize, Serialize};

/// The installed release of a package, as recorded by the installation registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub keep_policies_up_to_date: bool,
}

impl Installation {
    pub fn new(name: impl Into<String>, version: Version, keep_policies_up_to_date: bool) -> Self {
        Self {
            name: name.into(),
            version,
            keep_policies_up_to_date,
        }
    }
}

/// Package names are lowercase, start with a letter or digit, and also
/// appear as file names under the state root.
pub fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        anyhow::bail!("invalid package name: must be 1-64 characters");
    }

    let mut chars = name.chars();
    let first_is_valid = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit());
    let rest_is_valid =
        chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_');
    if !first_is_valid || !rest_is_valid {
        anyhow::bail!("invalid package name: '{name}'");
    }

    Ok(())
}
