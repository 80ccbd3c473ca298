//! The ordered, singly linked list of migrations.

use super::error::MigrationError;
use super::generator::Migration;
use super::operation::apply_all;
use crate::catalog::Model;

/// Migrations in application order.
///
/// Sequences are contiguous from 1, every migration names its predecessor
/// as parent, and every migration starts from the model its predecessor
/// produced.
#[derive(Debug, Clone, Default)]
pub struct MigrationChain {
    migrations: Vec<Migration>,
}

impl MigrationChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain, checking every link.
    pub fn from_migrations(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut chain = Self::new();
        for migration in migrations {
            chain.push(migration)?;
        }
        Ok(chain)
    }

    /// Append a migration, checking that it links to the current head.
    pub fn push(&mut self, migration: Migration) -> Result<(), MigrationError> {
        let name = migration.parsed_name()?;
        if name.to_string() != migration.name || name.sequence != migration.sequence {
            return Err(conflict(format!(
                "migration {} records sequence {}",
                migration.name, migration.sequence
            )));
        }

        let expected_sequence = self.migrations.len() as u32 + 1;
        if migration.sequence != expected_sequence {
            return Err(conflict(format!(
                "migration {} has sequence {}, expected {}",
                migration.name, migration.sequence, expected_sequence
            )));
        }

        let expected_parent = self.head().map(|m| m.name.clone());
        if migration.parent != expected_parent {
            return Err(conflict(format!(
                "migration {} names parent {:?}, expected {:?}",
                migration.name, migration.parent, expected_parent
            )));
        }

        let head_hash = self.head_hash();
        if migration.from_hash != head_hash {
            return Err(conflict(format!(
                "migration {} starts from {} but the chain ends at {}",
                migration.name, migration.from_hash, head_hash
            )));
        }

        migration.verify_checksum()?;
        self.migrations.push(migration);
        Ok(())
    }

    /// All migrations, in order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Iterate over the migrations in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Migration> {
        self.migrations.iter()
    }

    /// Number of migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Check if the chain has no migrations.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// The most recent migration.
    pub fn head(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    /// Hash of the model the chain produces.
    pub fn head_hash(&self) -> String {
        match self.head() {
            Some(m) => m.to_hash.clone(),
            None => Model::new().content_hash(),
        }
    }

    /// Look up a migration by name.
    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.name == name)
    }

    /// Look up a migration by name, failing if it is missing.
    pub fn require(&self, name: &str) -> Result<&Migration, MigrationError> {
        self.get(name).ok_or_else(|| MigrationError::MigrationNotFound {
            name: name.to_string(),
        })
    }

    /// Replay the chain from the empty model.
    ///
    /// Element `i` of the result is the model after the first `i`
    /// migrations. Each replayed model must hash to the migration's
    /// recorded target.
    pub fn replay(&self) -> Result<Vec<Model>, MigrationError> {
        let mut models = Vec::with_capacity(self.migrations.len() + 1);
        let mut model = Model::new();
        models.push(model.clone());

        for migration in &self.migrations {
            apply_all(&mut model, &migration.up)?;
            let actual = model.content_hash();
            if actual != migration.to_hash {
                return Err(conflict(format!(
                    "replaying {} produces {} but it records {}",
                    migration.name, actual, migration.to_hash
                )));
            }
            models.push(model.clone());
        }
        Ok(models)
    }

    /// Model produced by the whole chain.
    pub fn head_model(&self) -> Result<Model, MigrationError> {
        let mut models = self.replay()?;
        Ok(models.pop().unwrap_or_default())
    }
}

impl<'a> IntoIterator for &'a MigrationChain {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.iter()
    }
}

fn conflict(message: String) -> MigrationError {
    MigrationError::SchemaConflict { message }
}
