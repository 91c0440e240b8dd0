use fleetpolicy_core::{CommitFailure, PolicyId};

use crate::UpgradeOutcome;

/// Fatal errors of an upgrade batch. Conflicts and skips are not errors.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("policy '{policy_id}' not found")]
    PolicyNotFound { policy_id: PolicyId },

    /// The store committed the batch but rejected some of its ids.
    #[error("bulk upgrade rejected {} policy(ies)", .failures.len())]
    CommitFailed {
        failures: Vec<CommitFailure>,
        outcomes: Vec<UpgradeOutcome>,
    },

    #[error("policy store {operation} failed{}", policy_suffix(.policy_id))]
    Store {
        operation: &'static str,
        policy_id: Option<PolicyId>,
        #[source]
        source: anyhow::Error,
    },

    #[error("installation registry lookup failed for package '{package_name}'")]
    Registry {
        package_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A dry run whose `has_errors` flag disagrees with its diff entries.
    #[error(
        "dry run of policy '{policy_id}' reported has_errors={has_errors} with {error_count} conflict error(s)"
    )]
    ContractViolation {
        policy_id: PolicyId,
        has_errors: bool,
        error_count: usize,
    },

    #[error("failed to build policy evaluation thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl UpgradeError {
    pub(crate) fn store(
        operation: &'static str,
        policy_id: Option<&PolicyId>,
        source: anyhow::Error,
    ) -> Self {
        Self::Store {
            operation,
            policy_id: policy_id.cloned(),
            source,
        }
    }
}

fn policy_suffix(policy_id: &Option<PolicyId>) -> String {
    policy_id
        .as_ref()
        .map(|id| format!(" for policy '{id}'"))
        .unwrap_or_default()
}
