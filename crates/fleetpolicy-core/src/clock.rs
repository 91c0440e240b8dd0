use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
