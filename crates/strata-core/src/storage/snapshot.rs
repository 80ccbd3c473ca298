//! Versioned model snapshots.

use super::write_json;
use crate::catalog::Model;
use crate::migration::MigrationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A model at one migration point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Version id. Version 0 is the empty model.
    pub version: u64,
    /// Content hash of `model`.
    pub hash: String,
    /// The model.
    pub model: Model,
}

impl Snapshot {
    /// Snapshot `model` as `version`.
    pub fn new(version: u64, model: Model) -> Self {
        Self {
            version,
            hash: model.content_hash(),
            model,
        }
    }

    /// The implicit version 0.
    pub fn empty() -> Self {
        Self::new(0, Model::new())
    }

    /// Check that the recorded hash matches the model.
    pub fn verify(&self, path: &Path) -> Result<(), MigrationError> {
        let actual = self.model.content_hash();
        if actual != self.hash {
            return Err(MigrationError::SnapshotCorrupted {
                path: path.to_path_buf(),
                expected: self.hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// File name within a [`SnapshotStore`].
    pub fn file_name(&self) -> String {
        format!("{:06}_{}.json", self.version, &self.hash[..12.min(self.hash.len())])
    }
}

/// Directory of snapshot files, one per version.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open a store, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a snapshot. Saving the same content twice is a no-op; a
    /// different model under an existing version is refused.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, MigrationError> {
        if snapshot.version == 0 {
            return Err(MigrationError::InvalidOperation {
                operation: "save snapshot".to_string(),
                message: "version 0 is the implicit empty model".to_string(),
            });
        }
        snapshot.verify(Path::new(&snapshot.file_name()))?;

        if let Some(existing) = self.load(snapshot.version)? {
            if existing.hash == snapshot.hash {
                return Ok(self.dir.join(snapshot.file_name()));
            }
            return Err(MigrationError::SchemaConflict {
                message: format!(
                    "snapshot version {} already exists with hash {}",
                    snapshot.version, existing.hash
                ),
            });
        }

        let path = self.dir.join(snapshot.file_name());
        write_json(&path, snapshot)?;
        debug!(version = snapshot.version, hash = %snapshot.hash, "snapshot saved");
        Ok(path)
    }

    /// Load a snapshot by version. Version 0 is always present.
    pub fn load(&self, version: u64) -> Result<Option<Snapshot>, MigrationError> {
        if version == 0 {
            return Ok(Some(Snapshot::empty()));
        }
        match self.files()?.remove(&version) {
            Some(path) => Ok(Some(read_snapshot(&path, version)?)),
            None => Ok(None),
        }
    }

    /// The highest stored version, or the empty snapshot.
    pub fn latest(&self) -> Result<Snapshot, MigrationError> {
        match self.files()?.pop_last() {
            Some((version, path)) => read_snapshot(&path, version),
            None => Ok(Snapshot::empty()),
        }
    }

    /// Stored versions, ascending. Does not include version 0.
    pub fn versions(&self) -> Result<Vec<u64>, MigrationError> {
        Ok(self.files()?.into_keys().collect())
    }

    fn files(&self) -> Result<BTreeMap<u64, PathBuf>, MigrationError> {
        let mut files = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(version) = stem.split('_').next().and_then(|v| v.parse::<u64>().ok()) else {
                continue;
            };
            if let Some(previous) = files.insert(version, path.clone()) {
                return Err(MigrationError::SchemaConflict {
                    message: format!(
                        "two snapshot files for version {}: {} and {}",
                        version,
                        previous.display(),
                        path.display()
                    ),
                });
            }
        }
        Ok(files)
    }
}

fn read_snapshot(path: &Path, version: u64) -> Result<Snapshot, MigrationError> {
    let json = fs::read_to_string(path)?;
    let snapshot: Snapshot = serde_json::from_str(&json)
        .map_err(|e| MigrationError::Deserialization(format!("{}: {}", path.display(), e)))?;
    if snapshot.version != version {
        return Err(MigrationError::Deserialization(format!(
            "{}: file name says version {} but content says {}",
            path.display(),
            version,
            snapshot.version
        )));
    }
    snapshot.verify(path)?;
    snapshot.model.validate()?;
    Ok(snapshot)
}
