//! Project workspace.
//!
//! A workspace is a directory holding `snapshots/` and `migrations/`. It
//! owns the stores and the runner configuration and exposes the operations
//! the CLI offers.

use crate::backend::Connection;
use crate::catalog::Model;
use crate::dialect::Dialect;
use crate::migration::{
    generate, Delta, GenerateOptions, Migration, MigrationChain, MigrationError, MigrationName,
    RenameHints, Resolution, RollbackScope, RunReport, Runner, RunnerConfig, StatusReport,
};
use crate::storage::{MigrationRepository, Snapshot, SnapshotStore};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Snapshot directory name.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Migration directory name.
pub const MIGRATIONS_DIR: &str = "migrations";

/// A Strata project on disk.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    snapshots: SnapshotStore,
    repository: MigrationRepository,
    config: RunnerConfig,
}

impl Workspace {
    /// Open a workspace, creating its directories if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let root = root.as_ref().to_path_buf();
        Ok(Self {
            snapshots: SnapshotStore::open(root.join(SNAPSHOTS_DIR))?,
            repository: MigrationRepository::open(root.join(MIGRATIONS_DIR))?,
            root,
            config: RunnerConfig::default(),
        })
    }

    /// Use `config` for runner operations.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Snapshot store.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Migration repository.
    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    /// A runner using this workspace's configuration.
    pub fn runner(&self) -> Runner {
        Runner::new(self.config.clone())
    }

    /// Load the migration chain.
    pub fn chain(&self) -> Result<MigrationChain, MigrationError> {
        self.repository.load()
    }

    /// Load the chain and check it against the snapshot store.
    ///
    /// Every migration must have a snapshot whose hash equals the model the
    /// chain replays to, and no snapshot may exist past the chain head.
    pub fn verify(&self) -> Result<MigrationChain, MigrationError> {
        let chain = self.chain()?;
        chain.replay()?;

        for migration in &chain {
            let version = migration.sequence as u64;
            let snapshot = self.snapshots.load(version)?.ok_or_else(|| MigrationError::SchemaConflict {
                message: format!("no snapshot for version {} ({})", version, migration.name),
            })?;
            if snapshot.hash != migration.to_hash {
                return Err(MigrationError::SchemaConflict {
                    message: format!(
                        "snapshot {} has hash {} but migration {} produces {}",
                        version, snapshot.hash, migration.name, migration.to_hash
                    ),
                });
            }
        }

        if let Some(orphan) = self
            .snapshots
            .versions()?
            .into_iter()
            .find(|v| *v > chain.len() as u64)
        {
            return Err(MigrationError::SchemaConflict {
                message: format!("snapshot {} has no migration", orphan),
            });
        }
        Ok(chain)
    }

    /// The model the chain currently ends at.
    pub fn latest_model(&self) -> Result<Model, MigrationError> {
        // After verify the newest snapshot is the chain head's model.
        self.verify()?;
        Ok(self.snapshots.latest()?.model)
    }

    /// Delta from the latest model to `desired`.
    pub fn diff(&self, desired: &Model, hints: &RenameHints) -> Result<Delta, MigrationError> {
        desired.validate()?;
        let current = self.latest_model()?;
        Delta::compute_with_renames(&current, desired, hints)
    }

    /// Generate the next migration towards `desired` and write it, together
    /// with the snapshot of `desired`.
    pub fn generate(
        &self,
        desired: &Model,
        description: &str,
        hints: &RenameHints,
        options: &GenerateOptions,
    ) -> Result<Migration, MigrationError> {
        desired.validate()?;
        let mut chain = self.verify()?;
        let current = chain.head_model()?;
        let name = MigrationName::new(chain.len() as u32 + 1, description)?;

        let delta = Delta::compute_with_renames(&current, desired, hints)?;
        let migration = generate(&delta, &name.to_string(), options)?
            .with_parent(chain.head().map(|m| m.name.clone()));
        chain.push(migration.clone())?;

        // The migration file is only kept once its snapshot exists.
        let path = self.repository.save(&migration)?;
        let snapshot = Snapshot::new(migration.sequence as u64, desired.clone());
        if let Err(e) = self.snapshots.save(&snapshot) {
            if let Err(cleanup) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "failed to remove migration without snapshot");
            }
            return Err(e);
        }
        info!(
            migration = %migration.name,
            operations = migration.up.len(),
            lossless = migration.is_lossless(),
            "migration generated"
        );
        Ok(migration)
    }

    /// Status of every migration against `conn`.
    pub fn status(&self, conn: &mut dyn Connection) -> Result<StatusReport, MigrationError> {
        self.runner().status(&self.verify()?, conn)
    }

    /// Apply pending migrations to `conn`.
    pub fn apply(&self, conn: &mut dyn Connection) -> Result<RunReport, MigrationError> {
        self.runner().apply(&self.verify()?, conn)
    }

    /// Roll back applied migrations on `conn`.
    pub fn rollback(
        &self,
        conn: &mut dyn Connection,
        scope: RollbackScope,
    ) -> Result<RunReport, MigrationError> {
        self.runner().rollback(&self.verify()?, conn, scope)
    }

    /// Render the SQL between two chain positions.
    pub fn script(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        dialect: &dyn Dialect,
    ) -> Result<String, MigrationError> {
        self.runner().script(&self.verify()?, from, to, dialect)
    }

    /// Settle a partial or inconsistent ledger entry.
    pub fn resolve(
        &self,
        conn: &mut dyn Connection,
        name: &str,
        resolution: Resolution,
    ) -> Result<(), MigrationError> {
        self.runner().resolve(&self.chain()?, conn, name, resolution)
    }

    /// Force-release the migration lock.
    pub fn unlock(&self, conn: &mut dyn Connection) -> Result<Option<String>, MigrationError> {
        self.runner().unlock(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, Constraint, Table};

    fn author() -> Model {
        Model::new().with_table(
            Table::new("Author")
                .with_column(Column::new("AuthorId", ColumnType::Integer).identity())
                .with_column(Column::new("Name", ColumnType::Text))
                .with_constraint(Constraint::primary_key("pk_Author", ["AuthorId"])),
        )
    }

    #[test]
    fn test_generate_writes_migration_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();

        let migration = workspace
            .generate(&author(), "create_author", &RenameHints::new(), &GenerateOptions::new())
            .unwrap();

        assert_eq!(migration.name, "0001_create_author");
        assert_eq!(migration.parent, None);
        assert!(dir.path().join("migrations/0001_create_author.json").exists());
        assert_eq!(workspace.snapshots().versions().unwrap(), vec![1]);
        assert_eq!(workspace.latest_model().unwrap(), author());
    }

    #[test]
    fn test_generate_links_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        workspace
            .generate(&author(), "create_author", &RenameHints::new(), &GenerateOptions::new())
            .unwrap();

        let mut table = author().table("Author").unwrap().clone();
        table.columns[1].name = "FullName".into();
        let renamed = Model::new().with_table(table);

        let hints = RenameHints::new().rename_column("Author", "Name", "FullName");
        let second = workspace
            .generate(&renamed, "rename_name", &hints, &GenerateOptions::new())
            .unwrap();

        assert_eq!(second.parent.as_deref(), Some("0001_create_author"));
        assert_eq!(second.up.len(), 1);
        assert_eq!(workspace.verify().unwrap().len(), 2);
    }

    #[test]
    fn test_generate_without_changes_fails() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();

        match workspace.generate(&Model::new(), "nothing", &RenameHints::new(), &GenerateOptions::new()) {
            Err(MigrationError::NoChanges { .. }) => {}
            other => panic!("Expected NoChanges, got {:?}", other),
        }
        assert!(workspace.chain().unwrap().is_empty());
    }

    #[test]
    fn test_failed_snapshot_write_leaves_no_migration() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        let file_name = Snapshot::new(1, author()).file_name();
        std::fs::create_dir(workspace.snapshots().dir().join(format!("{}.tmp", file_name))).unwrap();

        assert!(workspace
            .generate(&author(), "create_author", &RenameHints::new(), &GenerateOptions::new())
            .is_err());
        assert!(!dir.path().join("migrations/0001_create_author.json").exists());
        assert!(workspace.verify().unwrap().is_empty());
    }

    #[test]
    fn test_verify_detects_orphan_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        workspace.snapshots().save(&Snapshot::new(1, author())).unwrap();

        match workspace.verify() {
            Err(MigrationError::SchemaConflict { message }) => assert!(message.contains("no migration")),
            other => panic!("Expected SchemaConflict, got {:?}", other),
        }
    }
}
