mod decision;
mod error;
mod observer;
mod orchestrate;
mod simulate;
mod types;

pub use decision::{should_upgrade, skip_reason};
pub use error::UpgradeError;
pub use observer::{NoopObserver, TracingObserver, UpgradeObserver};
pub use orchestrate::UpgradeOrchestrator;
pub use simulate::{simulate, Simulation};
pub use types::{
    PolicyEvaluation, SkipReason, SkippedPolicy, UpgradeOptions, UpgradeOutcome, UpgradePlan,
    DEFAULT_CONCURRENCY,
};
