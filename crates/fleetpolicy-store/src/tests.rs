use super::*;
use fleetpolicy_core::{ConflictError, DiffAction, DiffEntry, Installation, PolicyInputs};
use fleetpolicy_registry::FileInstallationRegistry;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

const NGINX_1_0_0: &str = r#"
name = "nginx"
version = "1.0.0"

[inputs]
enabled = true

[inputs.logs]
level = "info"
paths = ["/var/log/nginx/access.log"]

[inputs.metrics]
period = "10s"
"#;

const NGINX_1_1_0: &str = r#"
name = "nginx"
version = "1.1.0"

[inputs]
enabled = true

[inputs.logs]
level = "warn"
paths = ["/var/log/nginx/access.log", "/var/log/nginx/error.log"]

[inputs.tls]
verify = true
"#;

#[test]
fn merge_applies_package_changes_to_untouched_fields() {
    let base = inputs(&[("logs.level", json!("info")), ("metrics.period", json!("10s"))]);
    let theirs = inputs(&[("logs.level", json!("warn")), ("tls.verify", json!(true))]);
    let ours = base.clone();

    let outcome = three_way_merge(&base, &theirs, &ours);
    assert!(!outcome.has_conflicts());
    assert_eq!(
        outcome.diff,
        vec![
            DiffEntry::change("logs.level", DiffAction::Update, Some(json!("info")), Some(json!("warn"))),
            DiffEntry::change("metrics.period", DiffAction::Remove, Some(json!("10s")), None),
            DiffEntry::change("tls.verify", DiffAction::Add, None, Some(json!(true))),
        ]
    );
    assert_eq!(outcome.merged, theirs);
}

#[test]
fn merge_keeps_customizations_the_package_did_not_touch() {
    let base = inputs(&[("enabled", json!(true)), ("logs.level", json!("info"))]);
    let theirs = inputs(&[("enabled", json!(true)), ("logs.level", json!("warn"))]);
    let ours = inputs(&[("enabled", json!(false)), ("logs.level", json!("info"))]);

    let outcome = three_way_merge(&base, &theirs, &ours);
    assert!(!outcome.has_conflicts());
    assert_eq!(outcome.diff.len(), 1);
    assert_eq!(outcome.merged.get("enabled"), Some(&json!(false)));
    assert_eq!(outcome.merged.get("logs.level"), Some(&json!("warn")));
}

#[test]
fn merge_reports_conflict_when_both_sides_changed_a_field() {
    let base = inputs(&[("logs.level", json!("info"))]);
    let theirs = inputs(&[("logs.level", json!("warn"))]);
    let ours = inputs(&[("logs.level", json!("debug"))]);

    let outcome = three_way_merge(&base, &theirs, &ours);
    assert!(outcome.has_conflicts());
    assert_eq!(
        outcome.diff,
        vec![
            DiffEntry::change("logs.level", DiffAction::Update, Some(json!("debug")), Some(json!("warn")))
                .with_error(ConflictError::new("logs.level", CONFLICT_MESSAGE))
        ]
    );
    assert_eq!(outcome.merged.get("logs.level"), Some(&json!("debug")));
}

#[test]
fn merge_skips_fields_that_already_match_the_new_package() {
    let base = inputs(&[("logs.level", json!("info"))]);
    let theirs = inputs(&[("logs.level", json!("warn"))]);
    let ours = inputs(&[("logs.level", json!("warn"))]);

    let outcome = three_way_merge(&base, &theirs, &ours);
    assert!(outcome.diff.is_empty());
    assert_eq!(outcome.merged, ours);
}

#[test]
fn dry_run_diff_reports_clean_upgrade() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    fixture.put_policy("id-1", "1.0.0", nginx_defaults_1_0_0());

    let result = fixture
        .store
        .dry_run_diff(&PolicyId::from("id-1"))
        .expect("dry run must succeed");
    assert_eq!(result.policy_name, "nginx-id-1");
    assert!(!result.has_errors);
    let keys = result.diff.iter().map(|entry| entry.id.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["logs.level", "logs.paths", "metrics.period", "tls.verify"]);
}

#[test]
fn dry_run_diff_reports_conflicting_customization() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    let mut customized = nginx_defaults_1_0_0();
    customized.insert("logs.level".to_string(), json!("debug"));
    fixture.put_policy("id-3", "1.0.0", customized);

    let result = fixture
        .store
        .dry_run_diff(&PolicyId::from("id-3"))
        .expect("dry run must succeed");
    assert!(result.has_errors);
    assert_eq!(
        result.conflict_errors(),
        vec![ConflictError::new("logs.level", CONFLICT_MESSAGE)]
    );
}

#[test]
fn dry_run_diff_fails_for_unknown_policy_and_missing_template() {
    let fixture = Fixture::new();
    fixture.install("nginx", "2.0.0", true);
    fixture.put_policy("id-1", "1.0.0", nginx_defaults_1_0_0());

    let err = fixture
        .store
        .dry_run_diff(&PolicyId::from("id-404"))
        .expect_err("unknown policy must fail");
    assert!(err.to_string().contains("policy 'id-404' not found"));

    let err = fixture
        .store
        .dry_run_diff(&PolicyId::from("id-1"))
        .expect_err("missing template must fail");
    assert!(
        format!("{err:#}").contains("package template nginx@2.0.0 not found"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn bulk_upgrade_commits_clean_policies_and_bumps_revision() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    let mut customized = nginx_defaults_1_0_0();
    customized.insert("enabled".to_string(), json!(false));
    fixture.put_policy("id-2", "1.0.0", customized);

    let report = fixture
        .store
        .bulk_upgrade(&[PolicyId::from("id-2")])
        .expect("bulk upgrade must succeed");
    assert!(report.is_complete());
    assert_eq!(report.upgraded, vec![PolicyId::from("id-2")]);

    let upgraded = fixture
        .store
        .read(&PolicyId::from("id-2"))
        .expect("must read policy")
        .expect("policy must exist");
    assert_eq!(upgraded.package_version, Version::new(1, 1, 0));
    assert_eq!(upgraded.revision, 2);
    assert_eq!(upgraded.inputs.get("enabled"), Some(&json!(false)));
    assert_eq!(upgraded.inputs.get("logs.level"), Some(&json!("warn")));
    assert_eq!(upgraded.inputs.get("tls.verify"), Some(&json!(true)));
    assert!(!upgraded.inputs.contains_key("metrics.period"));

    assert_eq!(
        read_active_transaction(fixture.store.layout()).expect("must read marker"),
        None
    );
    let second = fixture
        .store
        .dry_run_diff(&PolicyId::from("id-2"))
        .expect("dry run after upgrade must succeed");
    assert!(second.diff.is_empty());
}

#[test]
fn bulk_upgrade_reports_per_policy_failures_and_commits_the_rest() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    fixture.put_policy("id-1", "1.0.0", nginx_defaults_1_0_0());
    let mut customized = nginx_defaults_1_0_0();
    customized.insert("logs.level".to_string(), json!("debug"));
    fixture.put_policy("id-3", "1.0.0", customized);

    let report = fixture
        .store
        .bulk_upgrade(&[
            PolicyId::from("id-3"),
            PolicyId::from("id-1"),
            PolicyId::from("id-404"),
        ])
        .expect("bulk upgrade must succeed as a batch");
    assert_eq!(report.upgraded, vec![PolicyId::from("id-1")]);
    let failed = report
        .failures
        .iter()
        .map(|failure| failure.policy_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(failed, vec!["id-3", "id-404"]);
    assert!(report.failures[0].reason.contains("1 conflicting field(s)"));

    let untouched = fixture
        .store
        .read(&PolicyId::from("id-3"))
        .expect("must read policy")
        .expect("policy must exist");
    assert_eq!(untouched.revision, 1);
    assert_eq!(untouched.package_version, Version::new(1, 0, 0));
}

#[test]
fn bulk_upgrade_journals_each_step_and_settles_transaction() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    fixture.put_policy("id-1", "1.0.0", nginx_defaults_1_0_0());

    fixture
        .store
        .bulk_upgrade(&[PolicyId::from("id-1"), PolicyId::from("id-1")])
        .expect("bulk upgrade must succeed");

    let txid = single_transaction_id(fixture.store.layout());
    let metadata = read_transaction_metadata(fixture.store.layout(), &txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, TransactionStatus::Committed);
    assert_eq!(metadata.operation, "bulk_upgrade");
    assert_eq!(metadata.policy_count, 2);

    let steps = read_transaction_journal(fixture.store.layout(), &txid)
        .expect("must read journal")
        .into_iter()
        .map(|entry| format!("{}:{}", entry.step, entry.state))
        .collect::<Vec<_>>();
    assert_eq!(
        steps,
        vec!["stage_policy:id-1:done", "apply_policy:id-1:done"]
    );
    assert!(!fixture
        .store
        .layout()
        .transaction_staging_path(&txid)
        .exists());
}

#[test]
fn bulk_upgrade_refuses_to_start_while_a_transaction_is_active() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    fixture.put_policy("id-1", "1.0.0", nginx_defaults_1_0_0());
    let layout = fixture.store.layout();
    layout.ensure_base_dirs().expect("must create dirs");

    write_transaction_metadata(
        layout,
        &TransactionMetadata {
            version: 1,
            txid: "tx-busy".to_string(),
            operation: "bulk_upgrade".to_string(),
            status: TransactionStatus::Applying,
            started_at_unix: 1,
            policy_count: 1,
        },
    )
    .expect("must write metadata");
    claim_active_transaction(layout, &ActiveTransactionMarker::owned_by_current_process("tx-busy"))
        .expect("must claim marker");

    let err = fixture
        .store
        .bulk_upgrade(&[PolicyId::from("id-1")])
        .expect_err("active transaction must block the commit");
    assert!(
        err.to_string()
            .contains("transaction tx-busy is active (reason=active_status status=applying)"),
        "unexpected error: {err}"
    );

    let policy = fixture
        .store
        .read(&PolicyId::from("id-1"))
        .expect("must read policy")
        .expect("policy must exist");
    assert_eq!(policy.revision, 1);
}

#[test]
fn settled_marker_is_cleared_before_the_next_transaction() {
    let fixture = Fixture::new();
    let layout = fixture.store.layout();
    layout.ensure_base_dirs().expect("must create dirs");

    write_transaction_metadata(
        layout,
        &TransactionMetadata {
            version: 1,
            txid: "tx-old".to_string(),
            operation: "bulk_upgrade".to_string(),
            status: TransactionStatus::Committed,
            started_at_unix: 1,
            policy_count: 0,
        },
    )
    .expect("must write metadata");
    claim_active_transaction(layout, &ActiveTransactionMarker::new("tx-old"))
        .expect("must claim marker");

    ensure_no_active_transaction(layout).expect("settled marker must be cleared");
    assert_eq!(read_active_transaction(layout).expect("must read marker"), None);
}

#[test]
fn failed_transaction_needs_release_before_next_commit() {
    let fixture = Fixture::new();
    let layout = fixture.store.layout();
    layout.ensure_base_dirs().expect("must create dirs");

    write_transaction_metadata(
        layout,
        &TransactionMetadata {
            version: 1,
            txid: "tx-broken".to_string(),
            operation: "bulk_upgrade".to_string(),
            status: TransactionStatus::Failed,
            started_at_unix: 1,
            policy_count: 3,
        },
    )
    .expect("must write metadata");
    claim_active_transaction(layout, &ActiveTransactionMarker::new("tx-broken"))
        .expect("must claim marker");

    assert_eq!(
        transaction_health(layout).expect("must read health"),
        TransactionHealth::NeedsRepair {
            txid: Some("tx-broken".to_string()),
            reason: "failed".to_string(),
        }
    );
    let err = ensure_no_active_transaction(layout).expect_err("failed marker must block");
    assert!(err
        .to_string()
        .contains("transaction tx-broken requires repair (reason=failed)"));

    let released = release_transaction(layout)
        .expect("must release")
        .expect("failed transaction must be released");
    assert_eq!(released.txid, "tx-broken");
    assert_eq!(released.previous_status, Some(TransactionStatus::Failed));
    assert!(released.applied.is_empty());
    assert_eq!(transaction_health(layout).expect("must read health"), TransactionHealth::Idle);
    let metadata = read_transaction_metadata(layout, "tx-broken")
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, TransactionStatus::Released);
}

#[test]
fn abandoned_staging_transaction_is_released_and_commits_resume() {
    let fixture = Fixture::new();
    fixture.install("nginx", "1.1.0", true);
    fixture.put_policy("id-1", "1.0.0", nginx_defaults_1_0_0());
    let layout = fixture.store.layout();
    plant_transaction(layout, "tx-crashed", TransactionStatus::Staging);
    claim_active_transaction(layout, &ActiveTransactionMarker::new("tx-crashed"))
        .expect("must claim marker");
    let staging = layout.transaction_staging_path("tx-crashed");
    fs::create_dir_all(&staging).expect("must create staging");
    fs::write(staging.join("id-1.json"), "{}").expect("must write staged document");

    assert_eq!(
        transaction_health(layout).expect("must read health"),
        TransactionHealth::NeedsRepair {
            txid: Some("tx-crashed".to_string()),
            reason: "owner_exited status=staging".to_string(),
        }
    );
    let err = fixture
        .store
        .bulk_upgrade(&[PolicyId::from("id-1")])
        .expect_err("abandoned transaction must block the commit");
    assert!(err.to_string().contains("transaction tx-crashed requires repair"));

    let released = release_transaction(layout)
        .expect("must release")
        .expect("abandoned transaction must be released");
    assert_eq!(
        released,
        ReleasedTransaction {
            txid: "tx-crashed".to_string(),
            previous_status: Some(TransactionStatus::Staging),
            applied: Vec::new(),
        }
    );
    assert!(!staging.exists());
    let metadata = read_transaction_metadata(layout, "tx-crashed")
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, TransactionStatus::Aborted);

    let report = fixture
        .store
        .bulk_upgrade(&[PolicyId::from("id-1")])
        .expect("commit must proceed after release");
    assert_eq!(report.upgraded, vec![PolicyId::from("id-1")]);
}

#[test]
fn abandoned_applying_transaction_reports_replaced_policies() {
    let fixture = Fixture::new();
    let layout = fixture.store.layout();
    plant_transaction(layout, "tx-halfway", TransactionStatus::Applying);
    claim_active_transaction(layout, &ActiveTransactionMarker::new("tx-halfway"))
        .expect("must claim marker");
    for (seq, step) in ["stage_policy:id-1", "stage_policy:id-2", "apply_policy:id-1"]
        .into_iter()
        .enumerate()
    {
        append_transaction_journal_entry(
            layout,
            "tx-halfway",
            &TransactionJournalEntry {
                seq: seq as u64 + 1,
                step: step.to_string(),
                state: "done".to_string(),
                path: None,
            },
        )
        .expect("must append journal entry");
    }
    let mut journal = fs::OpenOptions::new()
        .append(true)
        .open(layout.transaction_journal_path("tx-halfway"))
        .expect("must open journal");
    std::io::Write::write_all(&mut journal, br#"{"seq":4,"step":"apply_pol"#)
        .expect("must write torn entry");

    let released = release_transaction(layout)
        .expect("must release")
        .expect("abandoned transaction must be released");
    assert_eq!(released.previous_status, Some(TransactionStatus::Applying));
    assert_eq!(released.applied, vec![PolicyId::from("id-1")]);
    assert_eq!(read_active_transaction(layout).expect("must read marker"), None);
    let metadata = read_transaction_metadata(layout, "tx-halfway")
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, TransactionStatus::Released);
}

#[test]
fn release_refuses_a_transaction_whose_owner_is_running() {
    let fixture = Fixture::new();
    let layout = fixture.store.layout();
    plant_transaction(layout, "tx-live", TransactionStatus::Staging);
    claim_active_transaction(
        layout,
        &ActiveTransactionMarker::owned_by_current_process("tx-live"),
    )
    .expect("must claim marker");

    let err = release_transaction(layout).expect_err("running owner must block release");
    assert!(
        err.to_string()
            .contains("transaction tx-live is still running (status=staging"),
        "unexpected error: {err}"
    );
    assert_eq!(
        read_active_transaction(layout)
            .expect("must read marker")
            .map(|marker| marker.txid),
        Some("tx-live".to_string())
    );
}

#[test]
fn interrupted_commit_keeps_the_marker_once_applying_started() {
    let fixture = Fixture::new();
    let layout = fixture.store.layout();
    layout.ensure_base_dirs().expect("must create dirs");
    claim_active_transaction(layout, &ActiveTransactionMarker::new("tx-cut"))
        .expect("must claim marker");
    fs::write(layout.transaction_metadata_path("tx-cut"), "{").expect("must corrupt metadata");

    settle_interrupted_transaction(layout, "tx-cut", TransactionStatus::Applying);
    assert_eq!(
        read_active_transaction(layout)
            .expect("must read marker")
            .map(|marker| marker.txid),
        Some("tx-cut".to_string())
    );

    settle_interrupted_transaction(layout, "tx-cut", TransactionStatus::Staging);
    assert_eq!(read_active_transaction(layout).expect("must read marker"), None);
}

#[test]
fn catalog_lists_versions_newest_first_and_checks_declared_identity() {
    let fixture = Fixture::new();
    let versions = fixture
        .store
        .catalog()
        .versions("nginx")
        .expect("must list versions")
        .into_iter()
        .map(|template| template.version.to_string())
        .collect::<Vec<_>>();
    assert_eq!(versions, vec!["1.1.0", "1.0.0"]);

    let misplaced = fixture
        .store
        .layout()
        .template_path("nginx", &Version::new(9, 9, 9));
    fs::write(&misplaced, NGINX_1_0_0).expect("must write misplaced template");
    let err = fixture
        .store
        .catalog()
        .template("nginx", &Version::new(9, 9, 9))
        .expect_err("mismatched template must fail");
    assert!(err.to_string().contains("declares nginx@1.0.0"));
}

#[test]
fn policy_ids_are_restricted_to_path_safe_names() {
    for bad in ["", "../escape", ".hidden", "a/b", "a b"] {
        let err = validate_policy_id(&PolicyId::from(bad)).expect_err("must reject id");
        assert!(err.to_string().contains("invalid policy id"), "id {bad:?}: {err}");
    }
    validate_policy_id(&PolicyId::from("nginx-1.prod_eu")).expect("must accept id");
}

#[test]
fn list_returns_policies_ordered_by_id() {
    let fixture = Fixture::new();
    fixture.put_policy("id-b", "1.0.0", PolicyInputs::new());
    fixture.put_policy("id-a", "1.0.0", PolicyInputs::new());

    let ids = fixture
        .store
        .list()
        .expect("must list policies")
        .into_iter()
        .map(|policy| policy.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["id-a", "id-b"]);
}

struct Fixture {
    root: PathBuf,
    registry: FileInstallationRegistry,
    store: FilePolicyStore<FileInstallationRegistry>,
}

impl Fixture {
    fn new() -> Self {
        let root = test_root();
        let registry = FileInstallationRegistry::new(&root);
        let store = FilePolicyStore::new(StoreLayout::new(&root), registry.clone());
        store
            .catalog()
            .add_template(NGINX_1_0_0)
            .expect("must add nginx 1.0.0");
        store
            .catalog()
            .add_template(NGINX_1_1_0)
            .expect("must add nginx 1.1.0");
        Self {
            root,
            registry,
            store,
        }
    }

    fn install(&self, name: &str, version: &str, keep_policies_up_to_date: bool) {
        self.registry
            .record(&Installation::new(
                name,
                Version::parse(version).expect("valid version"),
                keep_policies_up_to_date,
            ))
            .expect("must record installation");
    }

    fn put_policy(&self, id: &str, version: &str, inputs: PolicyInputs) {
        self.store
            .put(&PackagePolicy {
                id: PolicyId::from(id),
                name: format!("nginx-{id}"),
                package_name: "nginx".to_string(),
                package_version: Version::parse(version).expect("valid version"),
                inputs,
                revision: 1,
            })
            .expect("must write policy");
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn nginx_defaults_1_0_0() -> PolicyInputs {
    inputs(&[
        ("enabled", json!(true)),
        ("logs.level", json!("info")),
        ("logs.paths", json!(["/var/log/nginx/access.log"])),
        ("metrics.period", json!("10s")),
    ])
}

fn inputs(values: &[(&str, serde_json::Value)]) -> PolicyInputs {
    values
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn plant_transaction(layout: &StoreLayout, txid: &str, status: TransactionStatus) {
    layout.ensure_base_dirs().expect("must create dirs");
    write_transaction_metadata(
        layout,
        &TransactionMetadata {
            version: 1,
            txid: txid.to_string(),
            operation: "bulk_upgrade".to_string(),
            status,
            started_at_unix: 1,
            policy_count: 1,
        },
    )
    .expect("must write metadata");
}

fn single_transaction_id(layout: &StoreLayout) -> String {
    let mut txids = fs::read_dir(layout.transactions_dir())
        .expect("must read transactions dir")
        .filter_map(|entry| {
            let path = entry.expect("dir entry").path();
            (path.extension().and_then(|ext| ext.to_str()) == Some("json"))
                .then(|| path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string))
                .flatten()
        })
        .collect::<Vec<_>>();
    assert_eq!(txids.len(), 1, "expected exactly one transaction: {txids:?}");
    txids.remove(0)
}

fn test_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "fleetpolicy-store-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}
