mod clock;
mod diff;
mod installation;
mod policy;
mod ports;
mod template;

pub use clock::current_unix_timestamp;
pub use diff::{ConflictError, DiffAction, DiffEntry, DryRunDiffResult};
pub use installation::{validate_package_name, Installation};
pub use policy::{PackagePolicy, PolicyId, PolicyInputs};
pub use ports::{BulkUpgradeReport, CommitFailure, InstallationRegistry, PolicyStore};
pub use template::PackageTemplate;
