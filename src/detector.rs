use crate::checksum::digest;
use crate::constants::MAX_SNAPSHOT_BYTES;
use crate::error::Result;
use crate::metrics::IngestMetrics;
use crate::storage::Storage;
use crate::types::{ChangeLogEntry, ChangeType, FetchedContent, RawSnapshot, Severity};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of comparing a fresh payload with the latest stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub is_new: bool,
    pub checksum: String,
    pub previous_checksum: Option<String>,
}

/// Stateless change detector over the append-only snapshot log.
///
/// "Last checksum per source" is always a query against storage, so concurrent
/// invocations never share in-process state.
pub struct ChangeDetector {
    storage: Arc<dyn Storage>,
}

impl ChangeDetector {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Compare `content` with the latest snapshot of `source`; append a snapshot and a
    /// change-log row only when the checksum differs.
    pub async fn detect(&self, source: &str, content: &FetchedContent) -> Result<Detection> {
        self.detect_with_checksum(source, content, digest(&content.bytes))
            .await
    }

    /// Same as [`ChangeDetector::detect`] for callers that already hold the digest of `content`
    #[instrument(skip(self, content, checksum), fields(bytes = content.bytes.len(), kind = content.kind.as_str()))]
    pub async fn detect_with_checksum(
        &self,
        source: &str,
        content: &FetchedContent,
        checksum: String,
    ) -> Result<Detection> {
        let previous_checksum = self
            .storage
            .latest_snapshot(source)
            .await?
            .map(|s| s.checksum);

        if previous_checksum.as_deref() == Some(checksum.as_str()) {
            debug!(%checksum, "payload unchanged since last snapshot");
            IngestMetrics::record_unchanged(source);
            return Ok(Detection {
                is_new: false,
                checksum,
                previous_checksum,
            });
        }

        let now = Utc::now();
        let size = content.bytes.len();
        let mut snapshot = RawSnapshot {
            id: None,
            source: source.to_string(),
            payload: content.bytes[..size.min(MAX_SNAPSHOT_BYTES)].to_vec(),
            content_kind: content.kind,
            truncated: size > MAX_SNAPSHOT_BYTES,
            checksum: checksum.clone(),
            fetched_at: now,
        };

        let (change_type, severity, summary) = match &previous_checksum {
            None => (
                ChangeType::Insert,
                Severity::Info,
                format!("First snapshot of {} ({} bytes)", source, size),
            ),
            Some(old) => (
                ChangeType::Update,
                Severity::Warning,
                format!(
                    "{} content changed ({} bytes, {} -> {})",
                    source,
                    size,
                    short(old),
                    short(&checksum)
                ),
            ),
        };
        let mut entry = ChangeLogEntry {
            id: None,
            source: source.to_string(),
            // Source-level change, not tied to one entity
            entity_key: format!("{}:*", source),
            change_type,
            summary,
            severity,
            old_hash: previous_checksum.clone(),
            new_hash: checksum.clone(),
            occurred_at: now,
        };
        self.storage.append_snapshot(&mut snapshot, &mut entry).await?;

        IngestMetrics::record_snapshot_written(source);
        info!(
            %checksum,
            previous = previous_checksum.as_deref().unwrap_or("none"),
            change_type = change_type.as_str(),
            "recorded new snapshot"
        );
        Ok(Detection {
            is_new: true,
            checksum,
            previous_checksum,
        })
    }
}

fn short(checksum: &str) -> &str {
    &checksum[..checksum.len().min(12)]
}
