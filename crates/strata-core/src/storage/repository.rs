//! Migration files on disk.

use super::write_json;
use crate::migration::{Migration, MigrationChain, MigrationError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory of migration files, one `<name>.json` per migration.
#[derive(Debug, Clone)]
pub struct MigrationRepository {
    dir: PathBuf,
}

impl MigrationRepository {
    /// Open a repository, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Repository directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for migration `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Load every migration and link them into a chain.
    pub fn load(&self) -> Result<MigrationChain, MigrationError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        paths.retain(|p| p.extension().and_then(|e| e.to_str()) == Some("json"));
        paths.sort();

        let mut migrations = Vec::with_capacity(paths.len());
        for path in paths {
            let json = fs::read_to_string(&path)?;
            let migration: Migration = serde_json::from_str(&json)
                .map_err(|e| MigrationError::Deserialization(format!("{}: {}", path.display(), e)))?;
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if stem != migration.name {
                return Err(MigrationError::SchemaConflict {
                    message: format!(
                        "{} contains migration {}",
                        path.display(),
                        migration.name
                    ),
                });
            }
            migrations.push(migration);
        }
        migrations.sort_by_key(|m| m.sequence);

        let chain = MigrationChain::from_migrations(migrations)?;
        debug!(dir = %self.dir.display(), migrations = chain.len(), "migration chain loaded");
        Ok(chain)
    }

    /// Write a new migration file. Existing files are never overwritten.
    pub fn save(&self, migration: &Migration) -> Result<PathBuf, MigrationError> {
        migration.parsed_name()?;
        let path = self.path(&migration.name);
        if path.exists() {
            return Err(MigrationError::InvalidOperation {
                operation: format!("save {}", migration.name),
                message: format!("{} already exists", path.display()),
            });
        }
        write_json(&path, migration)?;
        debug!(migration = %migration.name, path = %path.display(), "migration saved");
        Ok(path)
    }
}
