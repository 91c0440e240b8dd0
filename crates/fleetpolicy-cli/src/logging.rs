use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

pub(crate) const LOG_ENV: &str = "FLEETPOLICY_LOG";
const DEFAULT_DIRECTIVE: &str = "warn";
const VERBOSE_DIRECTIVE: &str = "debug";

/// Installs the stderr subscriber; stdout is reserved for command results.
pub(crate) fn init_tracing(verbose: bool) -> Result<()> {
    let filter = build_env_filter(std::env::var(LOG_ENV).ok().as_deref(), verbose)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

pub(crate) fn build_env_filter(directive: Option<&str>, verbose: bool) -> Result<EnvFilter> {
    let directive = match directive.map(str::trim).filter(|value| !value.is_empty()) {
        Some(directive) => directive,
        None if verbose => VERBOSE_DIRECTIVE,
        None => DEFAULT_DIRECTIVE,
    };
    EnvFilter::try_new(directive)
        .map_err(|err| anyhow!("invalid {LOG_ENV} directive '{directive}': {err}"))
}
