use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictError {
    pub key: String,
    pub message: String,
}

impl ConflictError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Add,
    Update,
    Remove,
}

impl DiffAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

/// One field-level change proposed by a dry run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<DiffAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ConflictError>,
}

impl DiffEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn change(
        id: impl Into<String>,
        action: DiffAction,
        previous: Option<serde_json::Value>,
        next: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            action: Some(action),
            previous,
            next,
            errors: Vec::new(),
        }
    }

    pub fn with_error(mut self, error: ConflictError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn has_conflicts(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunDiffResult {
    pub policy_name: String,
    #[serde(default)]
    pub diff: Vec<DiffEntry>,
    #[serde(default)]
    pub has_errors: bool,
}

impl DryRunDiffResult {
    /// Every conflict error of the diff, in entry order.
    pub fn conflict_errors(&self) -> Vec<ConflictError> {
        self.diff
            .iter()
            .flat_map(|entry| entry.errors.iter().cloned())
            .collect()
    }
}
