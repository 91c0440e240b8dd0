use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::{DryRunDiffResult, Installation, PackagePolicy, PolicyId};

/// Read access to the record of installed packages.
pub trait InstallationRegistry: Send + Sync {
    fn get(&self, package_name: &str) -> Result<Option<Installation>>;
}

/// Read/write access to applied package policies.
pub trait PolicyStore: Send + Sync {
    fn get(&self, id: &PolicyId) -> Result<Option<PackagePolicy>>;

    /// Simulates upgrading `id` to the installed version of its package.
    fn dry_run_diff(&self, id: &PolicyId) -> Result<DryRunDiffResult>;

    /// Commits the upgrade of every id in one logical operation.
    ///
    /// `Err` means the batch as a whole failed; ids that failed individually are
    /// listed in the report's `failures`.
    fn bulk_upgrade(&self, ids: &[PolicyId]) -> Result<BulkUpgradeReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUpgradeReport {
    pub upgraded: Vec<PolicyId>,
    pub failures: Vec<CommitFailure>,
}

impl BulkUpgradeReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFailure {
    pub policy_id: PolicyId,
    pub reason: String,
}

impl<T: InstallationRegistry + ?Sized> InstallationRegistry for Arc<T> {
    fn get(&self, package_name: &str) -> Result<Option<Installation>> {
        (**self).get(package_name)
    }
}

impl<T: InstallationRegistry + ?Sized> InstallationRegistry for &T {
    fn get(&self, package_name: &str) -> Result<Option<Installation>> {
        (**self).get(package_name)
    }
}

impl<T: PolicyStore + ?Sized> PolicyStore for Arc<T> {
    fn get(&self, id: &PolicyId) -> Result<Option<PackagePolicy>> {
        (**self).get(id)
    }

    fn dry_run_diff(&self, id: &PolicyId) -> Result<DryRunDiffResult> {
        (**self).dry_run_diff(id)
    }

    fn bulk_upgrade(&self, ids: &[PolicyId]) -> Result<BulkUpgradeReport> {
        (**self).bulk_upgrade(ids)
    }
}

impl<T: PolicyStore + ?Sized> PolicyStore for &T {
    fn get(&self, id: &PolicyId) -> Result<Option<PackagePolicy>> {
        (**self).get(id)
    }

    fn dry_run_diff(&self, id: &PolicyId) -> Result<DryRunDiffResult> {
        (**self).dry_run_diff(id)
    }

    fn bulk_upgrade(&self, ids: &[PolicyId]) -> Result<BulkUpgradeReport> {
        (**self).bulk_upgrade(ids)
    }
}
