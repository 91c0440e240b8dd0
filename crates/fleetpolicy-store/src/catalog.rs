use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use fleetpolicy_core::{validate_package_name, PackageTemplate};
use semver::Version;

use crate::StoreLayout;

/// Package templates laid out as `packages/<name>/<version>.toml`.
#[derive(Debug, Clone)]
pub struct PackageCatalog {
    layout: StoreLayout,
}

impl PackageCatalog {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn template(&self, name: &str, version: &Version) -> Result<Option<PackageTemplate>> {
        validate_package_name(name)?;
        let path = self.layout.template_path(name, version);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read package template: {}", path.display())
                });
            }
        };

        let template = PackageTemplate::from_toml_str(&content)
            .with_context(|| format!("failed to load package template: {}", path.display()))?;
        if template.name != name || &template.version != version {
            anyhow::bail!(
                "package template {} declares {}@{} (expected {}@{})",
                path.display(),
                template.name,
                template.version,
                name,
                version
            );
        }
        Ok(Some(template))
    }

    pub fn require_template(&self, name: &str, version: &Version) -> Result<PackageTemplate> {
        self.template(name, version)?.with_context(|| {
            format!(
                "package template {name}@{version} not found at {}",
                self.layout.template_path(name, version).display()
            )
        })
    }

    /// Every template of `name`, newest version first.
    pub fn versions(&self, name: &str) -> Result<Vec<PackageTemplate>> {
        validate_package_name(name)?;
        let dir = self.layout.package_dir(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut templates = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read package directory: {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                continue;
            }

            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read package template: {}", path.display()))?;
            let template = PackageTemplate::from_toml_str(&content)
                .with_context(|| format!("failed to load package template: {}", path.display()))?;
            templates.push(template);
        }

        templates.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(templates)
    }

    /// Parses `content` and stores it under the name and version it declares.
    pub fn add_template(&self, content: &str) -> Result<PathBuf> {
        let template = PackageTemplate::from_toml_str(content)?;
        validate_package_name(&template.name)?;
        let dir = self.layout.package_dir(&template.name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create package directory: {}", dir.display()))?;

        let path = self.layout.template_path(&template.name, &template.version);
        fs::write(&path, content)
            .with_context(|| format!("failed to write package template: {}", path.display()))?;
        Ok(path)
    }
}
