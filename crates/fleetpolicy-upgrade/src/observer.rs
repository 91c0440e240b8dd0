use std::sync::Arc;

use fleetpolicy_core::{BulkUpgradeReport, PolicyId};

use crate::{SkippedPolicy, UpgradeOutcome};

/// Receives the orchestrator's per-id decisions and commit results.
///
/// Evaluation may run on several threads, so callbacks for different ids can
/// arrive concurrently and in any order.
pub trait UpgradeObserver: Send + Sync {
    fn policy_skipped(&self, _skipped: &SkippedPolicy) {}

    fn policy_clean(&self, _policy_id: &PolicyId, _package_name: &str) {}

    fn policy_conflicted(&self, _outcome: &UpgradeOutcome, _package_name: &str) {}

    fn commit_started(&self, _commit_set: &[PolicyId]) {}

    fn commit_finished(&self, _report: &BulkUpgradeReport) {}
}

macro_rules! forward_observer {
    () => {
        fn policy_skipped(&self, skipped: &SkippedPolicy) {
            (**self).policy_skipped(skipped)
        }

        fn policy_clean(&self, policy_id: &PolicyId, package_name: &str) {
            (**self).policy_clean(policy_id, package_name)
        }

        fn policy_conflicted(&self, outcome: &UpgradeOutcome, package_name: &str) {
            (**self).policy_conflicted(outcome, package_name)
        }

        fn commit_started(&self, commit_set: &[PolicyId]) {
            (**self).commit_started(commit_set)
        }

        fn commit_finished(&self, report: &BulkUpgradeReport) {
            (**self).commit_finished(report)
        }
    };
}

impl<T: UpgradeObserver + ?Sized> UpgradeObserver for &T {
    forward_observer!();
}

impl<T: UpgradeObserver + ?Sized> UpgradeObserver for Arc<T> {
    forward_observer!();
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl UpgradeObserver for NoopObserver {}

/// Emits every callback as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl UpgradeObserver for TracingObserver {
    fn policy_skipped(&self, skipped: &SkippedPolicy) {
        tracing::debug!(
            policy_id = %skipped.policy_id,
            package = %skipped.package_name,
            reason = skipped.reason.as_str(),
            "skipping policy upgrade"
        );
    }

    fn policy_clean(&self, policy_id: &PolicyId, package_name: &str) {
        tracing::debug!(
            policy_id = %policy_id,
            package = %package_name,
            "policy upgrade simulated cleanly"
        );
    }

    fn policy_conflicted(&self, outcome: &UpgradeOutcome, package_name: &str) {
        let keys = outcome
            .errors
            .iter()
            .map(|error| error.key.as_str())
            .collect::<Vec<_>>()
            .join(",");
        tracing::warn!(
            policy_id = %outcome.package_policy_id,
            package = %package_name,
            reason = "conflict",
            conflicts = outcome.errors.len(),
            keys = %keys,
            "policy upgrade blocked by conflicts"
        );
    }

    fn commit_started(&self, commit_set: &[PolicyId]) {
        tracing::info!(policies = commit_set.len(), "committing policy upgrades");
    }

    fn commit_finished(&self, report: &BulkUpgradeReport) {
        for policy_id in &report.upgraded {
            tracing::info!(policy_id = %policy_id, "policy upgraded");
        }
        for failure in &report.failures {
            tracing::warn!(
                policy_id = %failure.policy_id,
                reason = %failure.reason,
                "policy upgrade rejected by store"
            );
        }
    }
}
