use super::{merge_entity, EntityFilter, Storage, UpsertOutcome};
use crate::error::{Result, WatchError};
use crate::types::{ChangeLogEntry, IngestionRun, RawSnapshot, SanctionsEntity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// In-memory storage implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    snapshots: Arc<Mutex<Vec<RawSnapshot>>>,
    change_log: Arc<Mutex<Vec<ChangeLogEntry>>>,
    entities: Arc<Mutex<HashMap<String, SanctionsEntity>>>,
    runs: Arc<Mutex<HashMap<Uuid, IngestionRun>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| WatchError::Storage("in-memory store lock poisoned".into()))
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn append_snapshot(
        &self,
        snapshot: &mut RawSnapshot,
        entry: &mut ChangeLogEntry,
    ) -> Result<()> {
        // Both locks are held for the whole append; readers never see one without the other
        let mut snapshots = lock(&self.snapshots)?;
        let mut change_log = lock(&self.change_log)?;
        let id = Uuid::new_v4();
        snapshot.id = Some(id);
        entry.id = Some(Uuid::new_v4());
        snapshots.push(snapshot.clone());
        change_log.push(entry.clone());
        debug!("Appended snapshot for {} with id {}", snapshot.source, id);
        Ok(())
    }

    async fn latest_snapshot(&self, source: &str) -> Result<Option<RawSnapshot>> {
        let snapshots = lock(&self.snapshots)?;
        // max_by_key keeps the last of equal elements, i.e. the most recently appended
        Ok(snapshots
            .iter()
            .filter(|s| s.source == source)
            .max_by_key(|s| s.fetched_at)
            .cloned())
    }

    async fn list_snapshots(&self, source: &str) -> Result<Vec<RawSnapshot>> {
        let snapshots = lock(&self.snapshots)?;
        Ok(snapshots.iter().filter(|s| s.source == source).cloned().collect())
    }

    async fn list_change_log(&self, source: &str) -> Result<Vec<ChangeLogEntry>> {
        let log = lock(&self.change_log)?;
        Ok(log.iter().filter(|e| e.source == source).cloned().collect())
    }

    async fn upsert_entity(&self, entity: &SanctionsEntity) -> Result<UpsertOutcome> {
        let mut entities = lock(&self.entities)?;
        match entities.get_mut(&entity.entity_key) {
            Some(existing) => {
                *existing = merge_entity(existing, entity);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                entities.insert(entity.entity_key.clone(), entity.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get_entity(&self, entity_key: &str) -> Result<Option<SanctionsEntity>> {
        Ok(lock(&self.entities)?.get(entity_key).cloned())
    }

    async fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<SanctionsEntity>> {
        let entities = lock(&self.entities)?;
        let mut found: Vec<SanctionsEntity> = entities
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn create_run(&self, run: &mut IngestionRun) -> Result<()> {
        let id = Uuid::new_v4();
        run.id = Some(id);
        lock(&self.runs)?.insert(id, run.clone());
        debug!("Created ingestion run for {} with id {}", run.source, id);
        Ok(())
    }

    async fn update_run(&self, run: &IngestionRun) -> Result<()> {
        let run_id = run
            .id
            .ok_or_else(|| WatchError::Storage("Cannot update ingestion run without ID".into()))?;
        let mut runs = lock(&self.runs)?;
        if !runs.contains_key(&run_id) {
            return Err(WatchError::Storage(format!("Unknown ingestion run {run_id}")));
        }
        runs.insert(run_id, run.clone());
        debug!("Updated ingestion run {} to {}", run_id, run.status.as_str());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<IngestionRun>> {
        Ok(lock(&self.runs)?.get(&id).cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>> {
        let runs = lock(&self.runs)?;
        let mut all: Vec<IngestionRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }
}
