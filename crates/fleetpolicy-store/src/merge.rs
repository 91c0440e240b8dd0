use std::collections::BTreeSet;

use fleetpolicy_core::{ConflictError, DiffAction, DiffEntry, PolicyInputs};
use serde_json::Value;

pub const CONFLICT_MESSAGE: &str = "Conflict detected";

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub diff: Vec<DiffEntry>,
    pub merged: PolicyInputs,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        self.diff.iter().any(DiffEntry::has_conflicts)
    }
}

/// Merges the package's move from `base` to `theirs` into the policy's `ours`.
///
/// A key produces a diff entry only when the package changed it and the policy
/// does not already hold the new value. The entry conflicts when the policy had
/// also diverged from `base`; conflicting keys keep the policy's value in
/// `merged`.
pub fn three_way_merge(base: &PolicyInputs, theirs: &PolicyInputs, ours: &PolicyInputs) -> MergeOutcome {
    let keys = base
        .keys()
        .chain(theirs.keys())
        .chain(ours.keys())
        .collect::<BTreeSet<_>>();

    let mut diff = Vec::new();
    let mut merged = ours.clone();
    for key in keys {
        let base_value = base.get(key);
        let their_value = theirs.get(key);
        let our_value = ours.get(key);

        if their_value == base_value || our_value == their_value {
            continue;
        }

        let entry = DiffEntry::change(
            key.clone(),
            change_action(our_value, their_value),
            our_value.cloned(),
            their_value.cloned(),
        );
        if our_value != base_value {
            diff.push(entry.with_error(ConflictError::new(key.clone(), CONFLICT_MESSAGE)));
            continue;
        }

        match their_value {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
        diff.push(entry);
    }

    MergeOutcome { diff, merged }
}

fn change_action(current: Option<&Value>, next: Option<&Value>) -> DiffAction {
    match (current, next) {
        (None, _) => DiffAction::Add,
        (_, None) => DiffAction::Remove,
        _ => DiffAction::Update,
    }
}
