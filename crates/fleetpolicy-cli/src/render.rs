use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use anyhow::{Context, Result};
use fleetpolicy_core::{BulkUpgradeReport, CommitFailure, DiffEntry, PackagePolicy};
use fleetpolicy_store::{ReleasedTransaction, TransactionHealth};
use fleetpolicy_upgrade::{SkippedPolicy, UpgradeOutcome, UpgradePlan};
use semver::Version;
use serde::Serialize;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty()),
    )
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, no_color: bool) -> OutputStyle {
    if stdout_is_tty && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let (badge, badge_style) = status_badge(status);
            format!("{} {message}", colorize(badge_style, badge))
        }
    }
}

pub(crate) fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn status_badge(status: &str) -> (&'static str, Style) {
    match status {
        "ok" => ("[OK]", badge_style(AnsiColor::BrightGreen)),
        "warn" => ("[WARN]", badge_style(AnsiColor::BrightYellow)),
        "err" => ("[ERR]", badge_style(AnsiColor::BrightRed)),
        _ => ("[..]", badge_style(AnsiColor::BrightBlue)),
    }
}

fn badge_style(color: AnsiColor) -> Style {
    Style::new()
        .fg_color(Some(color.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn format_plan_lines(plan: &UpgradePlan, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for policy_id in &plan.commit_set {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("would_upgrade policy={policy_id}"),
        ));
    }
    for outcome in &plan.outcomes {
        lines.extend(format_outcome_lines(outcome, style));
    }
    for skipped in &plan.skipped {
        lines.push(format_skipped_line(skipped, style));
    }
    lines.push(format!(
        "plan: upgrade={} conflicted={} skipped={}",
        plan.commit_set.len(),
        plan.outcomes.len(),
        plan.skipped.len()
    ));
    lines
}

pub(crate) fn format_upgrade_lines(
    outcomes: &[UpgradeOutcome],
    report: Option<&BulkUpgradeReport>,
    skipped: &[SkippedPolicy],
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::new();
    let (upgraded, rejected) = match report {
        Some(report) => (report.upgraded.as_slice(), report.failures.as_slice()),
        None => (&[][..], &[][..]),
    };

    for policy_id in upgraded {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("upgraded policy={policy_id}"),
        ));
    }
    for failure in rejected {
        lines.push(render_status_line(
            style,
            "err",
            &format!(
                "rejected policy={} reason={}",
                failure.policy_id,
                quote(&failure.reason)
            ),
        ));
    }
    for outcome in outcomes {
        lines.extend(format_outcome_lines(outcome, style));
    }
    for skipped in skipped {
        lines.push(format_skipped_line(skipped, style));
    }
    lines.push(format!(
        "upgrade: upgraded={} conflicted={} rejected={} skipped={}",
        upgraded.len(),
        outcomes.len(),
        rejected.len(),
        skipped.len()
    ));
    lines
}

fn format_outcome_lines(outcome: &UpgradeOutcome, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "warn",
        &format!(
            "conflicted policy={} errors={}",
            outcome.package_policy_id,
            outcome.errors.len()
        ),
    )];
    lines.extend(
        outcome
            .diff
            .iter()
            .map(|entry| format!("  {}", format_diff_entry(entry))),
    );
    lines
}

fn format_skipped_line(skipped: &SkippedPolicy, style: OutputStyle) -> String {
    render_status_line(
        style,
        "skip",
        &format!(
            "skipped policy={} package={} reason={}",
            skipped.policy_id,
            skipped.package_name,
            skipped.reason.as_str()
        ),
    )
}

pub(crate) fn format_diff_entry(entry: &DiffEntry) -> String {
    let mut line = format!("field={}", entry.id);
    if let Some(action) = entry.action {
        line.push_str(&format!(" action={}", action.as_str()));
    }
    if let Some(previous) = &entry.previous {
        line.push_str(&format!(" previous={previous}"));
    }
    if let Some(next) = &entry.next {
        line.push_str(&format!(" next={next}"));
    }
    for error in &entry.errors {
        line.push_str(&format!(" conflict={}", quote(&error.message)));
    }
    line
}

pub(crate) fn format_policy_line(
    policy: &PackagePolicy,
    installed: Option<(&Version, bool)>,
) -> String {
    let installed = match installed {
        Some((version, managed)) => format!("installed={version} managed={managed}"),
        None => "installed=none managed=false".to_string(),
    };
    format!(
        "policy={} name={} package={} version={} revision={} {installed}",
        policy.id,
        quote(&policy.name),
        policy.package_name,
        policy.package_version,
        policy.revision
    )
}

pub(crate) fn format_transaction_health_line(health: &TransactionHealth) -> String {
    match health {
        TransactionHealth::Idle => "transaction: clean".to_string(),
        TransactionHealth::Active { txid, status } => {
            format!("transaction: active {txid} (status={})", status.as_str())
        }
        TransactionHealth::NeedsRepair { txid, reason } => format!(
            "transaction: failed {} (reason={reason})",
            txid.as_deref().unwrap_or("<unknown>")
        ),
    }
}

pub(crate) fn format_released_transaction_line(released: &ReleasedTransaction) -> String {
    let status = released
        .previous_status
        .map(|status| status.as_str())
        .unwrap_or("unknown");
    let applied = if released.applied.is_empty() {
        "none".to_string()
    } else {
        released
            .applied
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        "released {} (status={status} applied={applied})",
        released.txid
    )
}

#[derive(Serialize)]
struct UpgradeJson<'a> {
    outcomes: &'a [UpgradeOutcome],
    failures: &'a [CommitFailure],
}

/// `upgrade --json` output: conflicted outcomes plus the store's per-id rejections.
pub(crate) fn format_upgrade_json(
    outcomes: &[UpgradeOutcome],
    failures: &[CommitFailure],
) -> Result<String> {
    serde_json::to_string_pretty(&UpgradeJson { outcomes, failures })
        .context("failed to serialize upgrade outcomes")
}

/// Values containing whitespace are quoted so each line stays `key=value` parsable.
fn quote(value: &str) -> String {
    if value.is_empty() || value.chars().any(char::is_whitespace) || value.contains('"') {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}
