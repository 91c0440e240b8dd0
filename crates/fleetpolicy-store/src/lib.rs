use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fleetpolicy_core::{
    BulkUpgradeReport, CommitFailure, DryRunDiffResult, InstallationRegistry, PackagePolicy,
    PolicyId, PolicyStore,
};
use semver::Version;

mod catalog;
mod layout;
mod merge;
mod transactions;
mod types;

pub use catalog::PackageCatalog;
pub use layout::{default_state_root, validate_policy_id, StoreLayout};
pub use merge::{three_way_merge, MergeOutcome, CONFLICT_MESSAGE};
pub use transactions::{
    append_transaction_journal_entry, begin_transaction, claim_active_transaction,
    clear_active_transaction, ensure_no_active_transaction, read_active_transaction,
    read_transaction_journal, read_transaction_metadata, release_transaction,
    settle_interrupted_transaction, transaction_health, update_transaction_status,
    write_transaction_metadata, ReleasedTransaction, TransactionHealth,
};
pub use types::{
    ActiveTransactionMarker, TransactionJournalEntry, TransactionMetadata, TransactionStatus,
};
use transactions::{APPLY_STEP_PREFIX, STAGE_STEP_PREFIX};

const BULK_UPGRADE_OPERATION: &str = "bulk_upgrade";

/// What upgrading one policy to its package's installed version would do.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyUpgradePlan {
    pub target_version: Version,
    pub merge: MergeOutcome,
}

/// Policy store backed by one JSON document per policy under `<root>/policies`.
///
/// Dry runs merge the package template of the policy's current version, the
/// template of the installed version, and the policy's own inputs. Bulk
/// upgrades stage every document inside a journaled transaction before any
/// live document is replaced.
#[derive(Debug, Clone)]
pub struct FilePolicyStore<R> {
    layout: StoreLayout,
    catalog: PackageCatalog,
    registry: R,
}

impl<R: InstallationRegistry> FilePolicyStore<R> {
    pub fn new(layout: StoreLayout, registry: R) -> Self {
        Self {
            catalog: PackageCatalog::new(layout.clone()),
            layout,
            registry,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &PackageCatalog {
        &self.catalog
    }

    /// Writes `policy` as its current document, replacing any previous one.
    pub fn put(&self, policy: &PackagePolicy) -> Result<PathBuf> {
        validate_policy_id(&policy.id)?;
        let path = self.layout.policy_path(&policy.id);
        write_policy_document(&path, policy)?;
        Ok(path)
    }

    pub fn read(&self, id: &PolicyId) -> Result<Option<PackagePolicy>> {
        validate_policy_id(id)?;
        let path = self.layout.policy_path(id);
        let Some(policy) = read_policy_document(&path)? else {
            return Ok(None);
        };
        if &policy.id != id {
            anyhow::bail!(
                "policy document {} declares id '{}' (expected '{}')",
                path.display(),
                policy.id,
                id
            );
        }
        Ok(Some(policy))
    }

    /// Every stored policy, ordered by id.
    pub fn list(&self) -> Result<Vec<PackagePolicy>> {
        let dir = self.layout.policies_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut policies = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read policy directory: {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(policy) = read_policy_document(&path)? {
                policies.push(policy);
            }
        }

        policies.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(policies)
    }

    pub fn plan_upgrade(&self, policy: &PackagePolicy) -> Result<PolicyUpgradePlan> {
        let installation = self
            .registry
            .get(&policy.package_name)?
            .ok_or_else(|| anyhow!("package '{}' is not installed", policy.package_name))?;

        let base = self
            .catalog
            .require_template(&policy.package_name, &policy.package_version)?
            .input_defaults()?;
        let theirs = self
            .catalog
            .require_template(&policy.package_name, &installation.version)?
            .input_defaults()?;

        Ok(PolicyUpgradePlan {
            target_version: installation.version,
            merge: three_way_merge(&base, &theirs, &policy.inputs),
        })
    }

    fn stage_upgrade(&self, txid: &str, id: &PolicyId) -> Result<PathBuf> {
        let policy = self
            .read(id)?
            .ok_or_else(|| anyhow!("policy '{id}' not found"))?;
        let plan = self.plan_upgrade(&policy)?;
        if plan.merge.has_conflicts() {
            let conflicts = plan
                .merge
                .diff
                .iter()
                .filter(|entry| entry.has_conflicts())
                .count();
            anyhow::bail!(
                "policy '{id}' has {conflicts} conflicting field(s) against the installed package"
            );
        }

        let upgraded = policy.upgraded_to(&plan.target_version, plan.merge.merged)?;
        let staged_path = self.layout.staged_policy_path(txid, id);
        write_policy_document(&staged_path, &upgraded)?;
        Ok(staged_path)
    }

    /// Stages then applies `ids`; `phase` tracks how far the commit got.
    fn run_bulk_upgrade(
        &self,
        txid: &str,
        ids: &[PolicyId],
        phase: &mut TransactionStatus,
    ) -> Result<BulkUpgradeReport> {
        let mut journal_seq = 1_u64;
        let mut report = BulkUpgradeReport::default();
        let mut staged = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.stage_upgrade(txid, id) {
                Ok(path) => {
                    self.journal(
                        txid,
                        &mut journal_seq,
                        format!("{STAGE_STEP_PREFIX}{id}"),
                        "done",
                        Some(path.as_path()),
                    )?;
                    staged.push((id.clone(), path));
                }
                Err(err) => {
                    self.journal(
                        txid,
                        &mut journal_seq,
                        format!("{STAGE_STEP_PREFIX}{id}"),
                        "rejected",
                        None,
                    )?;
                    report.failures.push(CommitFailure {
                        policy_id: id.clone(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        update_transaction_status(&self.layout, txid, TransactionStatus::Applying)?;
        *phase = TransactionStatus::Applying;
        for (id, staged_path) in staged {
            let live_path = self.layout.policy_path(&id);
            fs::rename(&staged_path, &live_path).with_context(|| {
                format!(
                    "failed to apply staged policy {} to {}",
                    staged_path.display(),
                    live_path.display()
                )
            })?;
            self.journal(
                txid,
                &mut journal_seq,
                format!("{APPLY_STEP_PREFIX}{id}"),
                "done",
                Some(live_path.as_path()),
            )?;
            report.upgraded.push(id);
        }

        update_transaction_status(&self.layout, txid, TransactionStatus::Committed)?;
        clear_active_transaction(&self.layout)?;
        let _ = fs::remove_dir_all(self.layout.transaction_staging_path(txid));
        Ok(report)
    }

    fn journal(
        &self,
        txid: &str,
        seq: &mut u64,
        step: String,
        state: &str,
        path: Option<&Path>,
    ) -> Result<()> {
        append_transaction_journal_entry(
            &self.layout,
            txid,
            &TransactionJournalEntry {
                seq: *seq,
                step,
                state: state.to_string(),
                path: path.map(|path| path.display().to_string()),
            },
        )?;
        *seq += 1;
        Ok(())
    }
}

impl<R: InstallationRegistry> PolicyStore for FilePolicyStore<R> {
    fn get(&self, id: &PolicyId) -> Result<Option<PackagePolicy>> {
        self.read(id)
    }

    fn dry_run_diff(&self, id: &PolicyId) -> Result<DryRunDiffResult> {
        let policy = self
            .read(id)?
            .ok_or_else(|| anyhow!("policy '{id}' not found"))?;
        let plan = self
            .plan_upgrade(&policy)
            .with_context(|| format!("failed to simulate upgrade of policy '{id}'"))?;

        Ok(DryRunDiffResult {
            policy_name: policy.name,
            has_errors: plan.merge.has_conflicts(),
            diff: plan.merge.diff,
        })
    }

    fn bulk_upgrade(&self, ids: &[PolicyId]) -> Result<BulkUpgradeReport> {
        self.layout.ensure_base_dirs()?;
        let tx = begin_transaction(&self.layout, BULK_UPGRADE_OPERATION, ids.len() as u64)?;

        let mut phase = TransactionStatus::Staging;
        let result = self.run_bulk_upgrade(&tx.txid, ids, &mut phase);
        if result.is_err() {
            settle_interrupted_transaction(&self.layout, &tx.txid, phase);
        }
        result
    }
}

fn read_policy_document(path: &Path) -> Result<Option<PackagePolicy>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read policy document: {}", path.display()));
        }
    };

    let policy = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse policy document: {}", path.display()))?;
    Ok(Some(policy))
}

fn write_policy_document(path: &Path, policy: &PackagePolicy) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(policy)
        .with_context(|| format!("failed to serialize policy '{}'", policy.id))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write policy document: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace policy document: {}", path.display()))
}

#[cfg(test)]
mod tests;
