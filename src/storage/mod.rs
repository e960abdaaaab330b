//! Persistence boundary.
//!
//! The pipeline only needs append, upsert-by-key and "most recent by timestamp"
//! primitives; the read helpers exist for downstream lookups, the CLI and tests.

mod in_memory;
mod sqlite;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::types::{ChangeLogEntry, IngestionRun, RawSnapshot, SanctionsEntity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an upsert created the row or refreshed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Lookup filter for downstream entity queries
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub source: Option<String>,
    pub country: Option<String>,
    pub limit: Option<usize>,
}

impl EntityFilter {
    fn matches(&self, entity: &SanctionsEntity) -> bool {
        let source_ok = self.source.as_deref().map_or(true, |s| {
            entity
                .entity_key
                .split_once(':')
                .map_or(false, |(prefix, _)| prefix == s)
        });
        let country_ok = self.country.as_deref().map_or(true, |c| {
            entity
                .country
                .as_deref()
                .map_or(false, |ec| ec.eq_ignore_ascii_case(c))
        });
        source_ok && country_ok
    }
}

/// Storage trait for the ingestion pipeline's records
#[async_trait]
pub trait Storage: Send + Sync {
    // Snapshot log and change log (append-only). A snapshot and the change-log row
    // describing it are written together or not at all.
    async fn append_snapshot(
        &self,
        snapshot: &mut RawSnapshot,
        entry: &mut ChangeLogEntry,
    ) -> Result<()>;
    async fn latest_snapshot(&self, source: &str) -> Result<Option<RawSnapshot>>;
    async fn list_snapshots(&self, source: &str) -> Result<Vec<RawSnapshot>>;
    async fn list_change_log(&self, source: &str) -> Result<Vec<ChangeLogEntry>>;

    // Entities. The upsert must be atomic per key: it keeps the stored `first_seen`
    // and never moves `last_seen` backwards.
    async fn upsert_entity(&self, entity: &SanctionsEntity) -> Result<UpsertOutcome>;
    async fn get_entity(&self, entity_key: &str) -> Result<Option<SanctionsEntity>>;
    async fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<SanctionsEntity>>;

    // Ingestion runs
    async fn create_run(&self, run: &mut IngestionRun) -> Result<()>;
    async fn update_run(&self, run: &IngestionRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<IngestionRun>>;
    async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>>;
}

/// Apply an incoming entity on top of the stored one
pub(crate) fn merge_entity(existing: &SanctionsEntity, incoming: &SanctionsEntity) -> SanctionsEntity {
    SanctionsEntity {
        first_seen: existing.first_seen,
        last_seen: existing.last_seen.max(incoming.last_seen),
        ..incoming.clone()
    }
}
