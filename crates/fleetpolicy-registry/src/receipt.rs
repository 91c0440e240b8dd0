use anyhow::{anyhow, Context, Result};
use fleetpolicy_core::Installation;
use semver::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationRecord {
    pub installation: Installation,
    pub installed_at_unix: u64,
}

pub(crate) fn serialize_record(record: &InstallationRecord) -> String {
    let installation = &record.installation;
    let mut payload = String::new();
    payload.push_str(&format!("name={}\n", installation.name));
    payload.push_str(&format!("version={}\n", installation.version));
    payload.push_str(&format!(
        "keep_policies_up_to_date={}\n",
        installation.keep_policies_up_to_date
    ));
    payload.push_str(&format!("installed_at_unix={}\n", record.installed_at_unix));
    payload
}

pub(crate) fn parse_record(raw: &str) -> Result<InstallationRecord> {
    let mut name = None;
    let mut version = None;
    let mut keep_policies_up_to_date = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "name" => name = Some(v.to_string()),
            "version" => {
                version = Some(
                    Version::parse(v).with_context(|| format!("invalid version '{v}'"))?,
                )
            }
            "keep_policies_up_to_date" => keep_policies_up_to_date = Some(parse_flag(v)?),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallationRecord {
        installation: Installation {
            name: name.context("missing name")?,
            version: version.context("missing version")?,
            keep_policies_up_to_date: keep_policies_up_to_date.unwrap_or(false),
        },
        installed_at_unix: installed_at_unix.unwrap_or(0),
    })
}

fn parse_flag(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(anyhow!("invalid keep_policies_up_to_date: {value}")),
    }
}
