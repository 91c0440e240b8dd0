use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Field values of a policy keyed by dotted input path, e.g. `logs.retention.days`.
pub type PolicyInputs = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(String);

impl PolicyId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PolicyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PolicyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagePolicy {
    pub id: PolicyId,
    pub name: String,
    pub package_name: String,
    pub package_version: Version,
    #[serde(default)]
    pub inputs: PolicyInputs,
    #[serde(default)]
    pub revision: u64,
}

impl PackagePolicy {
    /// Returns the policy as it reads after an upgrade to `version` with `inputs`.
    ///
    /// The revision never wraps; an exhausted counter is an error.
    pub fn upgraded_to(&self, version: &Version, inputs: PolicyInputs) -> Result<Self> {
        let revision = self.revision.checked_add(1).ok_or_else(|| {
            anyhow!(
                "policy '{}' revision counter is exhausted at {}",
                self.id,
                self.revision
            )
        })?;

        Ok(Self {
            id: self.id.clone(),
            name: self.name.clone(),
            package_name: self.package_name.clone(),
            package_version: version.clone(),
            inputs,
            revision,
        })
    }
}
