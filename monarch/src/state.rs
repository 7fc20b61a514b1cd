//! The `migrations` metadata table.

use crate::error::Error;
use chrono::{DateTime, Utc};
use postgres::GenericClient;
use std::collections::HashSet;

pub const METADATA_TABLE: &str = "migrations";

const CREATE_METADATA_TABLE: &str = "CREATE TABLE IF NOT EXISTS migrations (
    migration_id TEXT PRIMARY KEY,
    migrated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// The migration's file name.
    pub id: String,
    pub migrated_at: DateTime<Utc>,
    /// Equal to `migrated_at` until the migration is reapplied.
    pub last_applied_at: DateTime<Utc>,
}

pub fn table_exists(client: &mut impl GenericClient) -> Result<bool, Error> {
    let exists: bool = client
        .query_one(
            "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1)",
            &[&METADATA_TABLE],
        )?
        .get(0);
    Ok(exists)
}

/// Create the metadata table if it is missing. Returns whether it was created.
pub fn ensure_table(client: &mut impl GenericClient) -> Result<bool, Error> {
    if table_exists(client)? {
        return Ok(false);
    }

    tracing::info!("creating metadata table {}", METADATA_TABLE);
    client.batch_execute(CREATE_METADATA_TABLE)?;
    Ok(true)
}

/// Every applied migration, ordered by id. Empty when the table does not
/// exist yet.
pub fn history(client: &mut impl GenericClient) -> Result<Vec<MigrationRecord>, Error> {
    if !table_exists(client)? {
        return Ok(vec![]);
    }

    let rows = client.query(
        "SELECT migration_id, migrated_at, last_applied_at FROM migrations ORDER BY migration_id",
        &[],
    )?;
    Ok(rows
        .into_iter()
        .map(|row| MigrationRecord {
            id: row.get(0),
            migrated_at: row.get(1),
            last_applied_at: row.get(2),
        })
        .collect())
}

/// Which migrations have been applied, read once at the start of a run.
#[derive(Debug, Default)]
pub struct MigrationState {
    migrated: HashSet<String>,
}

impl MigrationState {
    /// Read the applied ids. The metadata table must exist.
    pub fn load(client: &mut impl GenericClient) -> Result<Self, Error> {
        let migrated: HashSet<String> = client
            .query("SELECT migration_id FROM migrations", &[])?
            .into_iter()
            .map(|row| row.get(0))
            .collect();
        Ok(Self { migrated })
    }

    pub fn is_migrated(&self, id: &str) -> bool {
        self.migrated.contains(id)
    }

    pub fn len(&self) -> usize {
        self.migrated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrated.is_empty()
    }

    /// Record a first application. Fails with the server's unique violation
    /// if the id is already present.
    pub fn mark_migrated(&mut self, client: &mut impl GenericClient, id: &str) -> Result<(), Error> {
        client.execute("INSERT INTO migrations (migration_id) VALUES ($1)", &[&id])?;
        self.migrated.insert(id.to_string());
        Ok(())
    }

    /// Bump `last_applied_at` for an already applied migration.
    pub fn mark_reapplied(&self, client: &mut impl GenericClient, id: &str) -> Result<(), Error> {
        let updated = client.execute(
            "UPDATE migrations SET last_applied_at = now() WHERE migration_id = $1",
            &[&id],
        )?;
        if updated == 0 {
            return Err(Error::NotYetMigrated(id.to_string()));
        }
        Ok(())
    }
}
