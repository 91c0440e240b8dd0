use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub status: TransactionStatus,
    pub started_at_unix: u64,
    #[serde(default)]
    pub policy_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Lifecycle of a bulk commit.
///
/// `Aborted` stops before any live document is replaced; `Failed` may have
/// replaced some of them and needs an operator to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Staging,
    Applying,
    Committed,
    Aborted,
    Failed,
    Released,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
            Self::Released => "released",
        }
    }

    /// Whether a leftover active marker for this status can be cleared silently.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Released)
    }
}

/// Contents of `transactions/active`: the transaction holding the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTransactionMarker {
    pub txid: String,
    /// Process that claimed the marker; absent when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
}

impl ActiveTransactionMarker {
    pub fn new(txid: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            owner_pid: None,
        }
    }

    pub fn owned_by_current_process(txid: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            owner_pid: Some(std::process::id()),
        }
    }
}
