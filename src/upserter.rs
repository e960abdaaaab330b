use crate::config::SourceConfig;
use crate::error::Result;
use crate::storage::{Storage, UpsertOutcome};
use crate::types::{entity_key, CandidateEntity, SanctionsEntity};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Maps parsed candidates onto canonical entities keyed by `<source>:<name>`.
///
/// Idempotent at the data level: repeating a candidate only refreshes `last_seen`
/// and the mutable attributes.
pub struct EntityUpserter {
    storage: Arc<dyn Storage>,
}

impl EntityUpserter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn upsert(
        &self,
        candidate: &CandidateEntity,
        source: &SourceConfig,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let key = entity_key(&source.id, &candidate.name);
        let entity = SanctionsEntity {
            entity_key: key,
            list_name: source.list_name().to_string(),
            name: candidate.name.clone(),
            program: candidate.program.clone(),
            country: candidate.country.clone(),
            aliases: candidate.aliases.clone(),
            identifiers: serde_json::to_value(&candidate.identifiers)?,
            // Only used when the key is new; the store keeps the original first_seen otherwise
            first_seen: now,
            last_seen: now,
        };
        let outcome = self.storage.upsert_entity(&entity).await?;
        debug!(entity_key = %entity.entity_key, ?outcome, "upserted entity");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParserKind;
    use crate::storage::InMemoryStorage;

    fn ofac() -> SourceConfig {
        SourceConfig::new("OFAC", "http://localhost/sdn.csv", ParserKind::Delimited)
    }

    #[tokio::test]
    async fn repeated_upserts_keep_one_row_and_first_seen() {
        let store = Arc::new(InMemoryStorage::new());
        let upserter = EntityUpserter::new(store.clone());
        let mut candidate = CandidateEntity::named("Acme Corp");
        candidate.country = Some("RU".into());

        assert_eq!(
            upserter.upsert(&candidate, &ofac()).await.unwrap(),
            UpsertOutcome::Inserted
        );
        let first = store.get_entity("OFAC:Acme Corp").await.unwrap().unwrap();

        candidate.country = Some("BY".into());
        for _ in 0..3 {
            assert_eq!(
                upserter.upsert(&candidate, &ofac()).await.unwrap(),
                UpsertOutcome::Updated
            );
        }

        let all = store.list_entities(&Default::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        let latest = &all[0];
        assert_eq!(latest.first_seen, first.first_seen);
        assert!(latest.last_seen >= first.last_seen);
        assert_eq!(latest.country.as_deref(), Some("BY"));
        assert_eq!(latest.list_name, "OFAC");
    }

    #[tokio::test]
    async fn same_name_in_two_sources_is_two_entities() {
        let store = Arc::new(InMemoryStorage::new());
        let upserter = EntityUpserter::new(store.clone());
        let bis = SourceConfig::new("BIS", "http://localhost/bis", ParserKind::HtmlTable);
        let candidate = CandidateEntity::named("Acme Corp");

        upserter.upsert(&candidate, &ofac()).await.unwrap();
        upserter.upsert(&candidate, &bis).await.unwrap();

        assert!(store.get_entity("OFAC:Acme Corp").await.unwrap().is_some());
        assert!(store.get_entity("BIS:Acme Corp").await.unwrap().is_some());
    }
}
