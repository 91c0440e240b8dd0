use fleetpolicy_core::Installation;
use semver::Version;

use crate::SkipReason;

/// Whether policies of `installation` should move off `latest_version`.
///
/// Only packages with `keep_policies_up_to_date` set are eligible, and only
/// when the installed version differs from `latest_version`. A lower installed
/// version is still eligible: the installation is authoritative.
pub fn should_upgrade(latest_version: &Version, installation: &Installation) -> bool {
    skip_reason(latest_version, installation).is_none()
}

/// The reason `should_upgrade` declines, or `None` when it accepts.
pub fn skip_reason(latest_version: &Version, installation: &Installation) -> Option<SkipReason> {
    if !installation.keep_policies_up_to_date {
        return Some(SkipReason::NotManaged);
    }
    if &installation.version == latest_version {
        return Some(SkipReason::AlreadyCurrent);
    }
    None
}
