use fleetpolicy_core::{ConflictError, DiffEntry, PolicyId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// A requested policy that was not upgraded because its dry run conflicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeOutcome {
    pub package_policy_id: PolicyId,
    pub diff: Vec<DiffEntry>,
    pub errors: Vec<ConflictError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InstallationMissing,
    NotManaged,
    AlreadyCurrent,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstallationMissing => "installation_missing",
            Self::NotManaged => "not_managed",
            Self::AlreadyCurrent => "already_current",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPolicy {
    pub policy_id: PolicyId,
    pub package_name: String,
    pub reason: SkipReason,
}

/// Evaluation of one requested id, before the batch is partitioned.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvaluation {
    Skip(SkippedPolicy),
    Clean(PolicyId),
    Conflicted(UpgradeOutcome),
}

/// What `upgrade_managed_policies` would do, without committing anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub commit_set: Vec<PolicyId>,
    pub outcomes: Vec<UpgradeOutcome>,
    pub skipped: Vec<SkippedPolicy>,
}

impl UpgradePlan {
    pub fn from_evaluations(evaluations: impl IntoIterator<Item = PolicyEvaluation>) -> Self {
        evaluations
            .into_iter()
            .fold(Self::default(), |mut plan, evaluation| {
                match evaluation {
                    PolicyEvaluation::Skip(skipped) => plan.skipped.push(skipped),
                    PolicyEvaluation::Clean(id) => plan.commit_set.push(id),
                    PolicyEvaluation::Conflicted(outcome) => plan.outcomes.push(outcome),
                }
                plan
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Worker threads used to evaluate ids; `1` evaluates on the caller's thread.
    pub concurrency: usize,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}
