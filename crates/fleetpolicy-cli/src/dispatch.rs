use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use fleetpolicy_core::{BulkUpgradeReport, InstallationRegistry, PolicyId};
use fleetpolicy_registry::FileInstallationRegistry;
use fleetpolicy_store::{release_transaction, transaction_health, FilePolicyStore, StoreLayout};
use fleetpolicy_upgrade::{
    skip_reason, SkipReason, SkippedPolicy, TracingObserver, UpgradeError, UpgradeObserver,
    UpgradeOptions, UpgradeOrchestrator, UpgradeOutcome,
};

use crate::completion::write_completions_script;
use crate::config::{config_path, load_config, resolve_state_root, resolve_upgrade_options};
use crate::render::{
    current_output_style, format_plan_lines, format_policy_line, format_released_transaction_line,
    format_transaction_health_line, format_upgrade_json, format_upgrade_lines, print_lines,
    render_status_line, OutputStyle,
};
use crate::{Cli, Commands, Toggle};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let output_style = current_output_style();

    match cli.command {
        Commands::Upgrade {
            ids,
            all,
            dry_run,
            json,
        } => {
            let state = CliState::open(cli.state_root.as_deref(), cli.concurrency)?;
            let policy_ids = state.requested_policy_ids(ids, all)?;
            if dry_run {
                run_upgrade_plan(&state, &policy_ids, json, output_style)?;
            } else {
                run_upgrade(&state, &policy_ids, json, output_style)?;
            }
        }
        Commands::Check { id } => {
            let state = CliState::open(cli.state_root.as_deref(), cli.concurrency)?;
            let line = check_policy_line(&state, &PolicyId::from(id))?;
            println!("{line}");
        }
        Commands::List => {
            let state = CliState::open(cli.state_root.as_deref(), cli.concurrency)?;
            for policy in state.store.list()? {
                let installation = state.registry.get(&policy.package_name)?;
                let installed = installation.as_ref().map(|installation| {
                    (&installation.version, installation.keep_policies_up_to_date)
                });
                println!("{}", format_policy_line(&policy, installed));
            }
        }
        Commands::KeepUpToDate { package, state } => {
            let root = resolve_state_root(cli.state_root.as_deref())?;
            let registry = FileInstallationRegistry::new(root);
            let enabled = state == Toggle::On;
            if !registry.set_keep_policies_up_to_date(&package, enabled)? {
                return Err(anyhow!("package '{package}' is not installed"));
            }
            println!(
                "{}",
                render_status_line(
                    output_style,
                    "ok",
                    &format!("package={package} keep_policies_up_to_date={enabled}")
                )
            );
        }
        Commands::Doctor { release_failed } => {
            let root = resolve_state_root(cli.state_root.as_deref())?;
            let layout = StoreLayout::new(&root);
            if release_failed {
                match release_transaction(&layout)? {
                    Some(released) => {
                        tracing::info!(
                            txid = %released.txid,
                            applied = released.applied.len(),
                            "released transaction"
                        );
                        println!(
                            "{}",
                            render_status_line(
                                output_style,
                                "ok",
                                &format_released_transaction_line(&released)
                            )
                        );
                    }
                    None => println!(
                        "{}",
                        render_status_line(output_style, "step", "no transaction to release")
                    ),
                }
            }
            for line in doctor_lines(&root, &layout, cli.concurrency)? {
                println!("{}", render_status_line(output_style, "step", &line));
            }
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(shell, &mut stdout)?;
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Registry, store and resolved options for one invocation.
pub(crate) struct CliState {
    pub(crate) registry: FileInstallationRegistry,
    pub(crate) store: FilePolicyStore<FileInstallationRegistry>,
    pub(crate) options: UpgradeOptions,
}

impl CliState {
    pub(crate) fn open(
        state_root: Option<&Path>,
        concurrency: Option<usize>,
    ) -> Result<Self> {
        let root = resolve_state_root(state_root)?;
        let config = load_config(&root)?;
        let options = resolve_upgrade_options(&config, concurrency)?;
        tracing::debug!(
            state_root = %root.display(),
            concurrency = options.concurrency,
            "opened fleetpolicy state"
        );
        let registry = FileInstallationRegistry::new(&root);
        let store = FilePolicyStore::new(StoreLayout::new(&root), registry.clone());
        Ok(Self {
            registry,
            store,
            options,
        })
    }

    pub(crate) fn requested_policy_ids(&self, ids: Vec<String>, all: bool) -> Result<Vec<PolicyId>> {
        if all {
            return Ok(self
                .store
                .list()?
                .into_iter()
                .map(|policy| policy.id)
                .collect());
        }
        if ids.is_empty() {
            return Err(anyhow!("upgrade requires policy ids or --all"));
        }
        Ok(ids.into_iter().map(PolicyId::from).collect())
    }

    fn orchestrator<'a, O: UpgradeObserver>(
        &'a self,
        observer: O,
    ) -> UpgradeOrchestrator<
        &'a FileInstallationRegistry,
        &'a FilePolicyStore<FileInstallationRegistry>,
        O,
    > {
        UpgradeOrchestrator::new(&self.registry, &self.store, observer, self.options)
    }
}

fn run_upgrade_plan(
    state: &CliState,
    policy_ids: &[PolicyId],
    json: bool,
    output_style: OutputStyle,
) -> Result<()> {
    let plan = state
        .orchestrator(TracingObserver)
        .plan_managed_policy_upgrades(policy_ids)?;
    if json {
        let rendered =
            serde_json::to_string_pretty(&plan).context("failed to serialize upgrade plan")?;
        println!("{rendered}");
    } else {
        print_lines(&format_plan_lines(&plan, output_style));
    }
    Ok(())
}

fn run_upgrade(
    state: &CliState,
    policy_ids: &[PolicyId],
    json: bool,
    output_style: OutputStyle,
) -> Result<()> {
    let recorder = RecordingObserver::default();
    let result = state
        .orchestrator(&recorder)
        .upgrade_managed_policies(policy_ids);

    let (outcomes, failures) = match result {
        Ok(outcomes) => (outcomes, Vec::new()),
        Err(UpgradeError::CommitFailed { failures, outcomes }) => (outcomes, failures),
        Err(err) => return Err(err.into()),
    };

    if json {
        println!("{}", format_upgrade_json(&outcomes, &failures)?);
    } else {
        let report = recorder.report();
        let skipped = recorder.skipped_in_order(policy_ids);
        print_lines(&format_upgrade_lines(
            &outcomes,
            report.as_ref(),
            &skipped,
            output_style,
        ));
    }

    if !failures.is_empty() {
        return Err(anyhow!(
            "{} policy upgrade(s) rejected by the policy store",
            failures.len()
        ));
    }
    Ok(())
}

pub(crate) fn check_policy_line(state: &CliState, policy_id: &PolicyId) -> Result<String> {
    let policy = state
        .store
        .read(policy_id)?
        .ok_or_else(|| anyhow!("policy '{policy_id}' not found"))?;
    let installation = state.registry.get(&policy.package_name)?;

    let reason = match &installation {
        None => Some(SkipReason::InstallationMissing),
        Some(installation) => skip_reason(&policy.package_version, installation),
    };
    let installed = installation
        .as_ref()
        .map(|installation| installation.version.to_string())
        .unwrap_or_else(|| "none".to_string());
    let verdict = match reason {
        Some(reason) => format!("eligible=false reason={}", reason.as_str()),
        None => "eligible=true".to_string(),
    };

    Ok(format!(
        "policy={} package={} version={} installed={installed} {verdict}",
        policy.id, policy.package_name, policy.package_version
    ))
}

pub(crate) fn doctor_lines(
    root: &Path,
    layout: &StoreLayout,
    concurrency: Option<usize>,
) -> Result<Vec<String>> {
    let config = load_config(root)?;
    let options = resolve_upgrade_options(&config, concurrency)?;
    Ok(vec![
        format!("state_root: {}", root.display()),
        format!("config: {}", config_path(root).display()),
        format!("concurrency: {}", options.concurrency),
        format!("policies: {}", layout.policies_dir().display()),
        format!("packages: {}", layout.packages_dir().display()),
        format_transaction_health_line(&transaction_health(layout)?),
    ])
}

/// Forwards every event to tracing and keeps what the result lines need.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    skipped: Mutex<Vec<SkippedPolicy>>,
    report: Mutex<Option<BulkUpgradeReport>>,
}

impl RecordingObserver {
    pub(crate) fn report(&self) -> Option<BulkUpgradeReport> {
        self.report.lock().ok().and_then(|report| report.clone())
    }

    /// Skipped policies ordered like `requested`; evaluation order is not stable.
    pub(crate) fn skipped_in_order(&self, requested: &[PolicyId]) -> Vec<SkippedPolicy> {
        let mut skipped = self
            .skipped
            .lock()
            .map(|skipped| skipped.clone())
            .unwrap_or_default();
        skipped.sort_by_key(|entry| {
            requested
                .iter()
                .position(|id| id == &entry.policy_id)
                .unwrap_or(usize::MAX)
        });
        skipped
    }
}

impl UpgradeObserver for RecordingObserver {
    fn policy_skipped(&self, skipped: &SkippedPolicy) {
        TracingObserver.policy_skipped(skipped);
        if let Ok(mut entries) = self.skipped.lock() {
            entries.push(skipped.clone());
        }
    }

    fn policy_clean(&self, policy_id: &PolicyId, package_name: &str) {
        TracingObserver.policy_clean(policy_id, package_name);
    }

    fn policy_conflicted(&self, outcome: &UpgradeOutcome, package_name: &str) {
        TracingObserver.policy_conflicted(outcome, package_name);
    }

    fn commit_started(&self, commit_set: &[PolicyId]) {
        TracingObserver.commit_started(commit_set);
    }

    fn commit_finished(&self, report: &BulkUpgradeReport) {
        TracingObserver.commit_finished(report);
        if let Ok(mut slot) = self.report.lock() {
            *slot = Some(report.clone());
        }
    }
}
