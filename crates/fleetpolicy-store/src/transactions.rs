use anyhow::{anyhow, Context, Result};
use fleetpolicy_core::{current_unix_timestamp, PolicyId};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    ActiveTransactionMarker, StoreLayout, TransactionJournalEntry, TransactionMetadata,
    TransactionStatus,
};

static TRANSACTION_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) const STAGE_STEP_PREFIX: &str = "stage_policy:";
pub(crate) const APPLY_STEP_PREFIX: &str = "apply_policy:";

/// State of the active-transaction marker as reported by `doctor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionHealth {
    Idle,
    Active { txid: String, status: TransactionStatus },
    NeedsRepair { txid: Option<String>, reason: String },
}

/// A transaction an operator released from the active marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedTransaction {
    pub txid: String,
    /// Status found on disk; `None` when the metadata was missing.
    pub previous_status: Option<TransactionStatus>,
    /// Policies whose live documents the transaction had already replaced.
    pub applied: Vec<PolicyId>,
}

/// Claims the store for `marker.txid`; fails while any transaction holds it.
pub fn claim_active_transaction(
    layout: &StoreLayout,
    marker: &ActiveTransactionMarker,
) -> Result<()> {
    let path = layout.transaction_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content =
        serde_json::to_vec(marker).context("failed to serialize active transaction marker")?;

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let holder = read_active_transaction(layout)
                .ok()
                .flatten()
                .map(|held| format!(" by {}", held.txid))
                .unwrap_or_default();
            return Err(anyhow!(
                "store is already claimed{holder} (marker={})",
                path.display()
            ));
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to claim active marker: {}", path.display()));
        }
    };

    file.write_all(&content)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write active marker: {}", path.display()))
}

pub fn read_active_transaction(layout: &StoreLayout) -> Result<Option<ActiveTransactionMarker>> {
    let path = layout.transaction_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read active marker: {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&raw)
        .map(Some)
        .with_context(|| format!("failed parsing active marker: {}", path.display()))
}

pub fn clear_active_transaction(layout: &StoreLayout) -> Result<()> {
    let path = layout.transaction_active_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to clear active marker: {}", path.display()))
        }
    }
}

pub fn write_transaction_metadata(
    layout: &StoreLayout,
    metadata: &TransactionMetadata,
) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(metadata).with_context(|| {
        format!(
            "failed to serialize transaction metadata: {}",
            path.display()
        )
    })?;
    fs::write(&path, content).with_context(|| {
        format!(
            "failed to write transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(path)
}

pub fn read_transaction_metadata(
    layout: &StoreLayout,
    txid: &str,
) -> Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read transaction metadata file: {}",
                    path.display()
                )
            });
        }
    };

    let metadata = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed parsing transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(Some(metadata))
}

pub fn update_transaction_status(
    layout: &StoreLayout,
    txid: &str,
    status: TransactionStatus,
) -> Result<()> {
    let mut metadata = read_transaction_metadata(layout, txid)?
        .ok_or_else(|| anyhow!("transaction metadata not found for '{txid}'"))?;
    metadata.status = status;
    write_transaction_metadata(layout, &metadata)?;
    Ok(())
}

pub fn append_transaction_journal_entry(
    layout: &StoreLayout,
    txid: &str,
    entry: &TransactionJournalEntry,
) -> Result<PathBuf> {
    let path = layout.transaction_journal_path(txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let line = serde_json::to_string(entry)
        .with_context(|| format!("failed to serialize journal entry: {}", path.display()))?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.write_all(b"\n").with_context(|| {
        format!(
            "failed to append transaction journal newline: {}",
            path.display()
        )
    })?;
    file.flush()
        .with_context(|| format!("failed to flush transaction journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_transaction_journal(
    layout: &StoreLayout,
    txid: &str,
) -> Result<Vec<TransactionJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read transaction journal: {}", path.display()));
        }
    };

    let lines = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let mut entries = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            // A crash mid-append can only tear the final line.
            Err(_) if index + 1 == lines.len() => break,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed parsing transaction journal: {}", path.display())
                });
            }
        }
    }
    Ok(entries)
}

/// Writes staging metadata and claims the active marker, undoing the metadata
/// when another transaction already holds the marker.
pub fn begin_transaction(
    layout: &StoreLayout,
    operation: &str,
    policy_count: u64,
) -> Result<TransactionMetadata> {
    ensure_no_active_transaction(layout)?;

    let started_at_unix = current_unix_timestamp()?;
    let counter = TRANSACTION_COUNTER.fetch_add(1, Ordering::SeqCst);
    let txid = format!("tx-{started_at_unix}-{}-{counter}", std::process::id());
    let metadata = TransactionMetadata {
        version: 1,
        txid,
        operation: operation.to_string(),
        status: TransactionStatus::Staging,
        started_at_unix,
        policy_count,
    };

    write_transaction_metadata(layout, &metadata)?;
    let staging = layout.transaction_staging_path(&metadata.txid);
    fs::create_dir_all(&staging).with_context(|| {
        format!(
            "failed to create transaction staging dir: {}",
            staging.display()
        )
    })?;
    let marker = ActiveTransactionMarker::owned_by_current_process(&metadata.txid);
    if let Err(err) = claim_active_transaction(layout, &marker) {
        let _ = fs::remove_file(layout.transaction_metadata_path(&metadata.txid));
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    Ok(metadata)
}

pub fn ensure_no_active_transaction(layout: &StoreLayout) -> Result<()> {
    match transaction_health(layout)? {
        TransactionHealth::Idle => Ok(()),
        TransactionHealth::Active { txid, status } if status.is_settled() => {
            clear_active_transaction(layout)
                .with_context(|| format!("failed clearing settled transaction {txid}"))
        }
        TransactionHealth::Active { txid, status } => Err(anyhow!(
            "transaction {txid} is active (reason=active_status status={})",
            status.as_str()
        )),
        TransactionHealth::NeedsRepair { txid, reason } => Err(anyhow!(
            "transaction {} requires repair (reason={reason})",
            txid.as_deref().unwrap_or("<unknown>")
        )),
    }
}

pub fn transaction_health(layout: &StoreLayout) -> Result<TransactionHealth> {
    let active = match read_active_transaction(layout) {
        Ok(active) => active,
        Err(_) => {
            return Ok(TransactionHealth::NeedsRepair {
                txid: None,
                reason: format!(
                    "active_marker_unreadable path={}",
                    layout.transaction_active_path().display()
                ),
            });
        }
    };

    let Some(marker) = active else {
        return Ok(TransactionHealth::Idle);
    };
    let txid = marker.txid.clone();

    let metadata = match read_transaction_metadata(layout, &txid) {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            return Ok(TransactionHealth::NeedsRepair {
                reason: format!(
                    "metadata_missing path={}",
                    layout.transaction_metadata_path(&txid).display()
                ),
                txid: Some(txid),
            });
        }
        Err(_) => {
            return Ok(TransactionHealth::NeedsRepair {
                reason: format!(
                    "metadata_unreadable path={}",
                    layout.transaction_metadata_path(&txid).display()
                ),
                txid: Some(txid),
            });
        }
    };

    match metadata.status {
        TransactionStatus::Failed => {
            return Ok(TransactionHealth::NeedsRepair {
                txid: Some(txid),
                reason: "failed".to_string(),
            });
        }
        TransactionStatus::Staging | TransactionStatus::Applying
            if live_owner(&marker)?.is_none() =>
        {
            return Ok(TransactionHealth::NeedsRepair {
                txid: Some(txid),
                reason: format!("owner_exited status={}", metadata.status.as_str()),
            });
        }
        _ => {}
    }

    Ok(TransactionHealth::Active {
        txid,
        status: metadata.status,
    })
}

/// Records how a bulk commit that returned an error is left behind.
///
/// Before `Applying` no live document was replaced, so the transaction is
/// aborted and the store released. From `Applying` on it is marked failed and
/// keeps the active marker until an operator releases it.
pub fn settle_interrupted_transaction(
    layout: &StoreLayout,
    txid: &str,
    phase: TransactionStatus,
) {
    if phase == TransactionStatus::Applying {
        let _ = update_transaction_status(layout, txid, TransactionStatus::Failed);
        return;
    }

    let _ = update_transaction_status(layout, txid, TransactionStatus::Aborted);
    let _ = fs::remove_dir_all(layout.transaction_staging_path(txid));
    let _ = clear_active_transaction(layout);
}

/// Releases the store from a failed or abandoned transaction.
///
/// A `Failed` transaction, or a `Staging`/`Applying` one whose owner process
/// is gone, has its staging removed and its marker cleared. A transaction
/// still owned by a running process is refused. Returns `None` when no
/// transaction needed releasing.
pub fn release_transaction(layout: &StoreLayout) -> Result<Option<ReleasedTransaction>> {
    let Some(marker) = read_active_transaction(layout)? else {
        // An empty marker is left by a claim torn before its write.
        clear_active_transaction(layout)?;
        return Ok(None);
    };
    let previous_status =
        read_transaction_metadata(layout, &marker.txid)?.map(|metadata| metadata.status);

    let next_status = match previous_status {
        None => None,
        Some(
            TransactionStatus::Committed
            | TransactionStatus::Aborted
            | TransactionStatus::Released,
        ) => {
            clear_active_transaction(layout)?;
            return Ok(None);
        }
        Some(TransactionStatus::Failed) => Some(TransactionStatus::Released),
        Some(status @ (TransactionStatus::Staging | TransactionStatus::Applying)) => {
            if let Some(pid) = live_owner(&marker)? {
                return Err(anyhow!(
                    "transaction {} is still running (status={} owner_pid={pid})",
                    marker.txid,
                    status.as_str()
                ));
            }
            if status == TransactionStatus::Staging {
                Some(TransactionStatus::Aborted)
            } else {
                Some(TransactionStatus::Released)
            }
        }
    };

    let applied = applied_policies(layout, &marker.txid)?;
    if let Some(status) = next_status {
        update_transaction_status(layout, &marker.txid, status)?;
    }
    let staging = layout.transaction_staging_path(&marker.txid);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to remove staging dir: {}", staging.display()))?;
    }
    clear_active_transaction(layout)?;

    Ok(Some(ReleasedTransaction {
        txid: marker.txid,
        previous_status,
        applied,
    }))
}

fn applied_policies(layout: &StoreLayout, txid: &str) -> Result<Vec<PolicyId>> {
    Ok(read_transaction_journal(layout, txid)?
        .into_iter()
        .filter(|entry| entry.state == "done")
        .filter_map(|entry| {
            entry
                .step
                .strip_prefix(APPLY_STEP_PREFIX)
                .map(PolicyId::from)
        })
        .collect())
}

/// The marker's owner pid, when that process is still running.
fn live_owner(marker: &ActiveTransactionMarker) -> Result<Option<u32>> {
    let Some(pid) = marker.owner_pid else {
        return Ok(None);
    };
    if pid == std::process::id() || process_alive(pid)? {
        return Ok(Some(pid));
    }
    Ok(None)
}

fn process_alive(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .with_context(|| format!("failed probing transaction owner pid={pid}"))?;
        Ok(status.success())
    }

    #[cfg(windows)]
    {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .output()
            .with_context(|| format!("failed probing transaction owner pid={pid}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "owner probe failed for pid={pid}: status={}",
                output.status
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.contains(&format!(",\"{pid}\"")))
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Ok(true)
    }
}
