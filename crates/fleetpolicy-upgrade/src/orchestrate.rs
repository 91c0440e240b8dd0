use std::collections::HashSet;

use fleetpolicy_core::{InstallationRegistry, PolicyId, PolicyStore};
use rayon::prelude::*;

use crate::{
    simulate, skip_reason, PolicyEvaluation, SkipReason, SkippedPolicy, TracingObserver,
    UpgradeError, UpgradeObserver, UpgradeOptions, UpgradeOutcome, UpgradePlan,
};

/// Upgrades managed package policies to their packages' installed versions.
///
/// Each requested id is evaluated on its own: fetch, resolve installation,
/// decide, then dry run. Ids that simulate cleanly are committed together in a
/// single `bulk_upgrade` call; conflicted ones are returned as outcomes.
pub struct UpgradeOrchestrator<R, S, O = TracingObserver> {
    registry: R,
    store: S,
    observer: O,
    options: UpgradeOptions,
}

impl<R, S, O> UpgradeOrchestrator<R, S, O>
where
    R: InstallationRegistry,
    S: PolicyStore,
    O: UpgradeObserver,
{
    pub fn new(registry: R, store: S, observer: O, options: UpgradeOptions) -> Self {
        Self {
            registry,
            store,
            observer,
            options,
        }
    }

    pub fn options(&self) -> UpgradeOptions {
        self.options
    }

    /// Upgrades every eligible, conflict-free policy among `policy_ids`.
    ///
    /// Returns one outcome per conflicted policy, in input order. Skipped and
    /// committed policies produce no outcome.
    pub fn upgrade_managed_policies(
        &self,
        policy_ids: &[PolicyId],
    ) -> Result<Vec<UpgradeOutcome>, UpgradeError> {
        let plan = self.plan_managed_policy_upgrades(policy_ids)?;
        if plan.commit_set.is_empty() {
            return Ok(plan.outcomes);
        }

        self.observer.commit_started(&plan.commit_set);
        let report = self
            .store
            .bulk_upgrade(&plan.commit_set)
            .map_err(|source| UpgradeError::store("bulk_upgrade", None, source))?;
        self.observer.commit_finished(&report);

        if !report.is_complete() {
            return Err(UpgradeError::CommitFailed {
                failures: report.failures,
                outcomes: plan.outcomes,
            });
        }
        Ok(plan.outcomes)
    }

    /// Evaluates `policy_ids` without committing anything.
    pub fn plan_managed_policy_upgrades(
        &self,
        policy_ids: &[PolicyId],
    ) -> Result<UpgradePlan, UpgradeError> {
        let policy_ids = dedupe_preserving_order(policy_ids);
        let evaluations = self.evaluate_all(&policy_ids)?;
        Ok(UpgradePlan::from_evaluations(evaluations))
    }

    /// Fetch, resolve, decide and simulate one policy.
    pub fn evaluate(&self, policy_id: &PolicyId) -> Result<PolicyEvaluation, UpgradeError> {
        let policy = self
            .store
            .get(policy_id)
            .map_err(|source| UpgradeError::store("get", Some(policy_id), source))?
            .ok_or_else(|| UpgradeError::PolicyNotFound {
                policy_id: policy_id.clone(),
            })?;

        let installation = self
            .registry
            .get(&policy.package_name)
            .map_err(|source| UpgradeError::Registry {
                package_name: policy.package_name.clone(),
                source,
            })?;

        let reason = match &installation {
            None => Some(SkipReason::InstallationMissing),
            Some(installation) => skip_reason(&policy.package_version, installation),
        };
        if let Some(reason) = reason {
            let skipped = SkippedPolicy {
                policy_id: policy_id.clone(),
                package_name: policy.package_name,
                reason,
            };
            self.observer.policy_skipped(&skipped);
            return Ok(PolicyEvaluation::Skip(skipped));
        }

        let simulation = simulate(&self.store, policy_id)?;
        if simulation.has_errors() {
            let outcome = simulation.into_outcome();
            self.observer.policy_conflicted(&outcome, &policy.package_name);
            return Ok(PolicyEvaluation::Conflicted(outcome));
        }

        self.observer.policy_clean(policy_id, &policy.package_name);
        Ok(PolicyEvaluation::Clean(policy_id.clone()))
    }

    fn evaluate_all(&self, policy_ids: &[PolicyId]) -> Result<Vec<PolicyEvaluation>, UpgradeError> {
        if self.options.concurrency <= 1 || policy_ids.len() <= 1 {
            return policy_ids.iter().map(|id| self.evaluate(id)).collect();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.concurrency)
            .thread_name(|index| format!("fleetpolicy-eval-{index}"))
            .build()?;
        let results = pool.install(|| {
            policy_ids
                .par_iter()
                .map(|id| self.evaluate(id))
                .collect::<Vec<_>>()
        });
        results.into_iter().collect()
    }
}

fn dedupe_preserving_order(policy_ids: &[PolicyId]) -> Vec<PolicyId> {
    let mut seen = HashSet::new();
    policy_ids
        .iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect()
}
