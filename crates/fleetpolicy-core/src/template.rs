use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::PolicyInputs;

/// Input defaults shipped by one release of a package.
///
/// Nested `[inputs]` tables are addressed by dotted keys once flattened, so
/// `[inputs.logs] level = "info"` becomes `logs.level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageTemplate {
    pub name: String,
    pub version: Version,
    pub title: Option<String>,
    #[serde(default)]
    pub inputs: toml::Table,
}

impl PackageTemplate {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let template: Self =
            toml::from_str(input).context("failed to parse fleetpolicy package template")?;
        if template.name.trim().is_empty() {
            return Err(anyhow!("package template name must not be empty"));
        }
        validate_input_keys(&template.inputs, "").with_context(|| {
            format!(
                "invalid inputs for package template '{}' version {}",
                template.name, template.version
            )
        })?;
        Ok(template)
    }

    pub fn input_defaults(&self) -> anyhow::Result<PolicyInputs> {
        let mut flattened = PolicyInputs::new();
        flatten_table(&self.inputs, "", &mut flattened)?;
        Ok(flattened)
    }
}

fn validate_input_keys(table: &toml::Table, prefix: &str) -> anyhow::Result<()> {
    for (key, value) in table {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("input key must not be empty (under '{prefix}')"));
        }
        if trimmed.contains('.') {
            return Err(anyhow!(
                "input key '{key}' must not contain '.': nest it as a table instead"
            ));
        }
        if let toml::Value::Table(nested) = value {
            validate_input_keys(nested, &join_key(prefix, key))?;
        }
    }
    Ok(())
}

fn flatten_table(table: &toml::Table, prefix: &str, out: &mut PolicyInputs) -> anyhow::Result<()> {
    for (key, value) in table {
        let path = join_key(prefix, key);
        match value {
            toml::Value::Table(nested) => flatten_table(nested, &path, out)?,
            other => {
                let json = serde_json::to_value(other)
                    .with_context(|| format!("failed converting input '{path}'"))?;
                out.insert(path, json);
            }
        }
    }
    Ok(())
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
