use fleetpolicy_core::{ConflictError, DryRunDiffResult, PolicyId, PolicyStore};

use crate::{UpgradeError, UpgradeOutcome};

/// A dry run whose conflict errors have been flattened and checked against
/// the store's `has_errors` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    pub policy_id: PolicyId,
    pub result: DryRunDiffResult,
    pub errors: Vec<ConflictError>,
}

impl Simulation {
    pub fn has_errors(&self) -> bool {
        self.result.has_errors
    }

    pub fn into_outcome(self) -> UpgradeOutcome {
        UpgradeOutcome {
            package_policy_id: self.policy_id,
            diff: self.result.diff,
            errors: self.errors,
        }
    }
}

pub fn simulate<S>(store: &S, policy_id: &PolicyId) -> Result<Simulation, UpgradeError>
where
    S: PolicyStore + ?Sized,
{
    let result = store
        .dry_run_diff(policy_id)
        .map_err(|source| UpgradeError::store("dry_run_diff", Some(policy_id), source))?;
    let errors = result.conflict_errors();

    if result.has_errors == errors.is_empty() {
        return Err(UpgradeError::ContractViolation {
            policy_id: policy_id.clone(),
            has_errors: result.has_errors,
            error_count: errors.len(),
        });
    }

    Ok(Simulation {
        policy_id: policy_id.clone(),
        result,
        errors,
    })
}
