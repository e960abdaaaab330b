use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How a fetched payload should be treated downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Html,
    Binary,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Html => "html",
            ContentKind::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentKind::Text),
            "html" => Some(ContentKind::Html),
            "binary" => Some(ContentKind::Binary),
            _ => None,
        }
    }
}

/// Raw bytes returned by a source fetcher
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    pub kind: ContentKind,
}

/// A record extracted by a parser, before it becomes a [`SanctionsEntity`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub name: String,
    pub program: Option<String>,
    pub country: Option<String>,
    pub aliases: Vec<String>,
    /// Columns the parser recognised but does not map to a dedicated field
    pub identifiers: BTreeMap<String, String>,
}

impl CandidateEntity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One immutable copy of a source payload, appended only when its checksum changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub id: Option<Uuid>,
    pub source: String,
    /// Leading bytes of the payload exactly as fetched, at most `MAX_SNAPSHOT_BYTES`
    pub payload: Vec<u8>,
    pub content_kind: ContentKind,
    pub truncated: bool,
    pub checksum: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeType::Insert),
            "update" => Some(ChangeType::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            _ => None,
        }
    }
}

/// Audit row describing a source-level content change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: Option<Uuid>,
    pub source: String,
    pub entity_key: String,
    pub change_type: ChangeType,
    pub summary: String,
    pub severity: Severity,
    pub old_hash: Option<String>,
    pub new_hash: String,
    pub occurred_at: DateTime<Utc>,
}

/// Canonical watchlist entity, one per `<source>:<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionsEntity {
    pub entity_key: String,
    pub list_name: String,
    pub name: String,
    pub program: Option<String>,
    pub country: Option<String>,
    pub aliases: Vec<String>,
    pub identifiers: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Natural key for an entity within its source namespace
pub fn entity_key(source: &str, name: &str) -> String {
    format!("{}:{}", source, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "ok" => Some(RunStatus::Ok),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// Tracked execution of fetch + diff + parse + upsert for a single source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Option<Uuid>,
    pub source: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub rows: u64,
    pub checksum: Option<String>,
    pub error: Option<String>,
}

impl IngestionRun {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            rows: 0,
            checksum: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// Mark the run as succeeded. Returns false if it already reached a terminal state.
    pub fn finish_ok(&mut self, rows: u64, checksum: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Ok;
        self.rows = rows;
        self.checksum = Some(checksum);
        self.ended_at = Some(Utc::now());
        true
    }

    /// Mark the run as failed, keeping whatever progress was made.
    pub fn finish_error(&mut self, rows: u64, checksum: Option<String>, error: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Error;
        self.rows = rows;
        self.checksum = checksum;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_transitions_exactly_once() {
        let mut run = IngestionRun::new("OFAC");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finish_ok(3, "abc".into()));
        assert!(!run.finish_error(0, None, "late failure".into()));
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.rows, 3);
        assert!(run.error.is_none());
    }

    #[test]
    fn entity_key_is_namespaced_by_source() {
        assert_eq!(entity_key("OFAC", "Acme Corp"), "OFAC:Acme Corp");
    }

    #[test]
    fn enums_round_trip_through_their_labels() {
        for status in [RunStatus::Running, RunStatus::Ok, RunStatus::Error] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ChangeType::parse("update"), Some(ChangeType::Update));
        assert_eq!(Severity::parse("bogus"), None);
        for kind in [ContentKind::Text, ContentKind::Html, ContentKind::Binary] {
            assert_eq!(ContentKind::parse(kind.as_str()), Some(kind));
        }
    }
}
