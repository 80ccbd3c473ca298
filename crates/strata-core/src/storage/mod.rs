//! On-disk project storage.
//!
//! A project directory holds one JSON file per schema snapshot and one JSON
//! file per migration.

mod repository;
mod snapshot;

pub use repository::MigrationRepository;
pub use snapshot::{Snapshot, SnapshotStore};

/// Get the current timestamp in microseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_micros() as u64
}

pub(crate) fn write_json<T: serde::Serialize>(
    path: &std::path::Path,
    value: &T,
) -> Result<(), crate::migration::MigrationError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| crate::migration::MigrationError::Serialization(e.to_string()))?;
    // Write-then-rename: readers never observe a truncated file.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json + "\n")?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
