use super::{EntityFilter, Storage, UpsertOutcome};
use crate::error::{Result, WatchError};
use crate::types::{
    ChangeLogEntry, ChangeType, ContentKind, IngestionRun, RawSnapshot, RunStatus, SanctionsEntity,
    Severity,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// SQLite-backed record store
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS raw_snapshots (
        id          TEXT PRIMARY KEY,
        source      TEXT NOT NULL,
        payload     BLOB NOT NULL,
        content_kind TEXT NOT NULL,
        truncated   INTEGER NOT NULL,
        checksum    TEXT NOT NULL,
        fetched_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS raw_snapshots_source_time
        ON raw_snapshots (source, fetched_at);
    CREATE TABLE IF NOT EXISTS change_log (
        id           TEXT PRIMARY KEY,
        source       TEXT NOT NULL,
        entity_key   TEXT NOT NULL,
        change_type  TEXT NOT NULL,
        summary      TEXT NOT NULL,
        severity     TEXT NOT NULL,
        old_hash     TEXT,
        new_hash     TEXT NOT NULL,
        occurred_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sanctions_entities (
        entity_key   TEXT PRIMARY KEY,
        list_name    TEXT NOT NULL,
        name         TEXT NOT NULL,
        program      TEXT,
        country      TEXT,
        aliases      TEXT NOT NULL,
        identifiers  TEXT NOT NULL,
        first_seen   TEXT NOT NULL,
        last_seen    TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS ingestion_runs (
        id          TEXT PRIMARY KEY,
        source      TEXT NOT NULL,
        status      TEXT NOT NULL,
        started_at  TEXT NOT NULL,
        ended_at    TEXT,
        rows        INTEGER NOT NULL,
        checksum    TEXT,
        error       TEXT
    );
"#;

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| WatchError::Storage("sqlite connection lock poisoned".into()))
    }
}

// Fixed-width UTC timestamps sort lexicographically, which the ORDER BY and MAX() below rely on
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| WatchError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| WatchError::Storage(format!("bad id '{s}': {e}")))
}

fn bad_label(column: &str, value: &str) -> WatchError {
    WatchError::Storage(format!("unexpected {column} value '{value}'"))
}

struct SnapshotRow {
    id: String,
    source: String,
    payload: Vec<u8>,
    content_kind: String,
    truncated: bool,
    checksum: String,
    fetched_at: String,
}

impl SnapshotRow {
    const COLUMNS: &'static str =
        "id, source, payload, content_kind, truncated, checksum, fetched_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            payload: row.get(2)?,
            content_kind: row.get(3)?,
            truncated: row.get(4)?,
            checksum: row.get(5)?,
            fetched_at: row.get(6)?,
        })
    }

    fn into_snapshot(self) -> Result<RawSnapshot> {
        Ok(RawSnapshot {
            id: Some(parse_uuid(&self.id)?),
            source: self.source,
            payload: self.payload,
            content_kind: ContentKind::parse(&self.content_kind)
                .ok_or_else(|| bad_label("content_kind", &self.content_kind))?,
            truncated: self.truncated,
            checksum: self.checksum,
            fetched_at: parse_ts(&self.fetched_at)?,
        })
    }
}

struct EntityRow {
    entity_key: String,
    list_name: String,
    name: String,
    program: Option<String>,
    country: Option<String>,
    aliases: String,
    identifiers: String,
    first_seen: String,
    last_seen: String,
}

impl EntityRow {
    const COLUMNS: &'static str =
        "entity_key, list_name, name, program, country, aliases, identifiers, first_seen, last_seen";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_key: row.get(0)?,
            list_name: row.get(1)?,
            name: row.get(2)?,
            program: row.get(3)?,
            country: row.get(4)?,
            aliases: row.get(5)?,
            identifiers: row.get(6)?,
            first_seen: row.get(7)?,
            last_seen: row.get(8)?,
        })
    }

    fn into_entity(self) -> Result<SanctionsEntity> {
        Ok(SanctionsEntity {
            entity_key: self.entity_key,
            list_name: self.list_name,
            name: self.name,
            program: self.program,
            country: self.country,
            aliases: serde_json::from_str(&self.aliases)?,
            identifiers: serde_json::from_str(&self.identifiers)?,
            first_seen: parse_ts(&self.first_seen)?,
            last_seen: parse_ts(&self.last_seen)?,
        })
    }
}

struct RunRow {
    id: String,
    source: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    rows: i64,
    checksum: Option<String>,
    error: Option<String>,
}

impl RunRow {
    const COLUMNS: &'static str = "id, source, status, started_at, ended_at, rows, checksum, error";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            rows: row.get(5)?,
            checksum: row.get(6)?,
            error: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<IngestionRun> {
        Ok(IngestionRun {
            id: Some(parse_uuid(&self.id)?),
            source: self.source,
            status: RunStatus::parse(&self.status).ok_or_else(|| bad_label("status", &self.status))?,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            rows: self.rows.max(0) as u64,
            checksum: self.checksum,
            error: self.error,
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn append_snapshot(
        &self,
        snapshot: &mut RawSnapshot,
        entry: &mut ChangeLogEntry,
    ) -> Result<()> {
        let snapshot_id = Uuid::new_v4();
        let entry_id = Uuid::new_v4();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO raw_snapshots (id, source, payload, content_kind, truncated, checksum, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot_id.to_string(),
                snapshot.source,
                snapshot.payload,
                snapshot.content_kind.as_str(),
                snapshot.truncated,
                snapshot.checksum,
                ts(&snapshot.fetched_at)
            ],
        )?;
        tx.execute(
            "INSERT INTO change_log
                (id, source, entity_key, change_type, summary, severity, old_hash, new_hash, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry_id.to_string(),
                entry.source,
                entry.entity_key,
                entry.change_type.as_str(),
                entry.summary,
                entry.severity.as_str(),
                entry.old_hash,
                entry.new_hash,
                ts(&entry.occurred_at)
            ],
        )?;
        tx.commit()?;

        snapshot.id = Some(snapshot_id);
        entry.id = Some(entry_id);
        Ok(())
    }

    async fn latest_snapshot(&self, source: &str) -> Result<Option<RawSnapshot>> {
        let row = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM raw_snapshots WHERE source = ?1
                 ORDER BY fetched_at DESC, rowid DESC LIMIT 1",
                SnapshotRow::COLUMNS
            ))?;
            stmt.query_row(params![source], SnapshotRow::read).optional()?
        };
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    async fn list_snapshots(&self, source: &str) -> Result<Vec<RawSnapshot>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM raw_snapshots WHERE source = ?1 ORDER BY fetched_at, rowid",
                SnapshotRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![source], SnapshotRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    async fn list_change_log(&self, source: &str) -> Result<Vec<ChangeLogEntry>> {
        type LogRow = (
            String,
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            String,
            String,
        );
        let rows: Vec<LogRow> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, source, entity_key, change_type, summary, severity, old_hash, new_hash, occurred_at
                 FROM change_log WHERE source = ?1 ORDER BY occurred_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![source], |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(
                |(id, source, entity_key, change_type, summary, severity, old_hash, new_hash, at)| {
                    Ok(ChangeLogEntry {
                        id: Some(parse_uuid(&id)?),
                        source,
                        entity_key,
                        change_type: ChangeType::parse(&change_type)
                            .ok_or_else(|| bad_label("change_type", &change_type))?,
                        summary,
                        severity: Severity::parse(&severity)
                            .ok_or_else(|| bad_label("severity", &severity))?,
                        old_hash,
                        new_hash,
                        occurred_at: parse_ts(&at)?,
                    })
                },
            )
            .collect()
    }

    async fn upsert_entity(&self, entity: &SanctionsEntity) -> Result<UpsertOutcome> {
        let aliases = serde_json::to_string(&entity.aliases)?;
        let identifiers = serde_json::to_string(&entity.identifiers)?;

        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so the existence check and the write are atomic
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM sanctions_entities WHERE entity_key = ?1",
                params![entity.entity_key],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        tx.execute(
            "INSERT INTO sanctions_entities
                (entity_key, list_name, name, program, country, aliases, identifiers, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(entity_key) DO UPDATE SET
                list_name   = excluded.list_name,
                name        = excluded.name,
                program     = excluded.program,
                country     = excluded.country,
                aliases     = excluded.aliases,
                identifiers = excluded.identifiers,
                last_seen   = MAX(sanctions_entities.last_seen, excluded.last_seen)",
            params![
                entity.entity_key,
                entity.list_name,
                entity.name,
                entity.program,
                entity.country,
                aliases,
                identifiers,
                ts(&entity.first_seen),
                ts(&entity.last_seen)
            ],
        )?;
        tx.commit()?;

        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn get_entity(&self, entity_key: &str) -> Result<Option<SanctionsEntity>> {
        let row = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sanctions_entities WHERE entity_key = ?1",
                EntityRow::COLUMNS
            ))?;
            stmt.query_row(params![entity_key], EntityRow::read).optional()?
        };
        row.map(EntityRow::into_entity).transpose()
    }

    async fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<SanctionsEntity>> {
        // Key prefix match instead of LIKE so '%' or '_' in a source id cannot widen the filter
        let prefix = filter.source.as_ref().map(|s| format!("{s}:"));
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sanctions_entities
                 WHERE (?1 IS NULL OR substr(entity_key, 1, length(?1)) = ?1)
                   AND (?2 IS NULL OR country = ?2 COLLATE NOCASE)
                 ORDER BY entity_key LIMIT ?3",
                EntityRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![prefix, filter.country, limit], EntityRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn create_run(&self, run: &mut IngestionRun) -> Result<()> {
        let id = Uuid::new_v4();
        self.conn()?.execute(
            "INSERT INTO ingestion_runs (id, source, status, started_at, ended_at, rows, checksum, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                run.source,
                run.status.as_str(),
                ts(&run.started_at),
                run.ended_at.as_ref().map(ts),
                run.rows as i64,
                run.checksum,
                run.error
            ],
        )?;
        run.id = Some(id);
        Ok(())
    }

    async fn update_run(&self, run: &IngestionRun) -> Result<()> {
        let run_id = run
            .id
            .ok_or_else(|| WatchError::Storage("Cannot update ingestion run without ID".into()))?;
        let changed = self.conn()?.execute(
            "UPDATE ingestion_runs
             SET status = ?2, ended_at = ?3, rows = ?4, checksum = ?5, error = ?6
             WHERE id = ?1",
            params![
                run_id.to_string(),
                run.status.as_str(),
                run.ended_at.as_ref().map(ts),
                run.rows as i64,
                run.checksum,
                run.error
            ],
        )?;
        if changed == 0 {
            return Err(WatchError::Storage(format!("Unknown ingestion run {run_id}")));
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<IngestionRun>> {
        let row = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ingestion_runs WHERE id = ?1",
                RunRow::COLUMNS
            ))?;
            stmt.query_row(params![id.to_string()], RunRow::read).optional()?
        };
        row.map(RunRow::into_run).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ingestion_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                RunRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], RunRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(RunRow::into_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn entity(name: &str, country: &str, seen: DateTime<Utc>) -> SanctionsEntity {
        SanctionsEntity {
            entity_key: format!("OFAC:{name}"),
            list_name: "SDN".into(),
            name: name.into(),
            program: Some("SDN".into()),
            country: Some(country.into()),
            aliases: vec!["alias one".into()],
            identifiers: serde_json::json!({ "uid": "36" }),
            first_seen: seen,
            last_seen: seen,
        }
    }

    #[tokio::test]
    async fn entity_upsert_preserves_first_seen_and_advances_last_seen() {
        let dir = tempdir().unwrap();
        let store = SqliteStorage::open(dir.path().join("nested").join("watch.db")).unwrap();
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);

        let outcome = store.upsert_entity(&entity("Acme Corp", "RU", t0)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        let outcome = store.upsert_entity(&entity("Acme Corp", "BY", t1)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        // A stale write must not move last_seen backwards
        store.upsert_entity(&entity("Acme Corp", "BY", t0)).await.unwrap();

        let stored = store.get_entity("OFAC:Acme Corp").await.unwrap().unwrap();
        assert_eq!(stored.first_seen, parse_ts(&ts(&t0)).unwrap());
        assert_eq!(stored.last_seen, parse_ts(&ts(&t1)).unwrap());
        assert_eq!(stored.country.as_deref(), Some("BY"));
        assert_eq!(stored.aliases, vec!["alias one".to_string()]);
        assert_eq!(stored.identifiers["uid"], "36");
    }

    fn snapshot(checksum: &str, payload: &[u8], at: DateTime<Utc>) -> (RawSnapshot, ChangeLogEntry) {
        let snapshot = RawSnapshot {
            id: None,
            source: "OFAC".into(),
            payload: payload.to_vec(),
            content_kind: ContentKind::Text,
            truncated: false,
            checksum: checksum.into(),
            fetched_at: at,
        };
        let entry = ChangeLogEntry {
            id: None,
            source: "OFAC".into(),
            entity_key: "OFAC:*".into(),
            change_type: ChangeType::Update,
            summary: "changed".into(),
            severity: Severity::Warning,
            old_hash: Some("aaa".into()),
            new_hash: checksum.into(),
            occurred_at: at,
        };
        (snapshot, entry)
    }

    #[tokio::test]
    async fn snapshots_and_change_log_round_trip() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        for (i, checksum) in ["aaa", "bbb"].iter().enumerate() {
            let (mut snap, mut entry) = snapshot(checksum, b"name\n", now + Duration::seconds(i as i64));
            store.append_snapshot(&mut snap, &mut entry).await.unwrap();
            assert!(snap.id.is_some());
            assert!(entry.id.is_some());
        }
        let latest = store.latest_snapshot("OFAC").await.unwrap().unwrap();
        assert_eq!(latest.checksum, "bbb");
        assert_eq!(latest.content_kind, ContentKind::Text);
        assert_eq!(store.list_snapshots("OFAC").await.unwrap().len(), 2);

        let log = store.list_change_log("OFAC").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].change_type, ChangeType::Update);
        assert_eq!(log[0].old_hash.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn binary_payload_is_stored_byte_for_byte() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let pdf: &[u8] = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n\x00\xff";
        let (mut snap, mut entry) = snapshot("ccc", pdf, Utc::now());
        snap.content_kind = ContentKind::Binary;
        store.append_snapshot(&mut snap, &mut entry).await.unwrap();

        let stored = store.latest_snapshot("OFAC").await.unwrap().unwrap();
        assert_eq!(stored.payload, pdf);
        assert_eq!(stored.content_kind, ContentKind::Binary);
    }

    #[tokio::test]
    async fn failed_change_log_insert_rolls_back_the_snapshot() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_change_log BEFORE INSERT ON change_log
                 BEGIN SELECT RAISE(ABORT, 'change log unavailable'); END;",
            )
            .unwrap();

        let (mut snap, mut entry) = snapshot("aaa", b"name\n", Utc::now());
        assert!(store.append_snapshot(&mut snap, &mut entry).await.is_err());
        assert!(snap.id.is_none());
        assert!(store.latest_snapshot("OFAC").await.unwrap().is_none());
        assert!(store.list_change_log("OFAC").await.unwrap().is_empty());

        store
            .conn()
            .unwrap()
            .execute_batch("DROP TRIGGER reject_change_log;")
            .unwrap();
        store.append_snapshot(&mut snap, &mut entry).await.unwrap();
        assert_eq!(store.list_snapshots("OFAC").await.unwrap().len(), 1);
        assert_eq!(store.list_change_log("OFAC").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runs_are_created_updated_and_listed() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let mut run = IngestionRun::new("BIS");
        store.create_run(&mut run).await.unwrap();
        run.finish_error(4, None, "status: HTTP 503".into());
        store.update_run(&run).await.unwrap();

        let stored = store.get_run(run.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert_eq!(stored.rows, 4);
        assert_eq!(stored.error.as_deref(), Some("status: HTTP 503"));
        assert!(stored.ended_at.is_some());
        assert_eq!(store.recent_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_entities_filters_by_source_prefix_and_country() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        store.upsert_entity(&entity("Acme Corp", "RU", now)).await.unwrap();
        store.upsert_entity(&entity("Globex", "KP", now)).await.unwrap();
        let mut other = entity("Acme Corp", "RU", now);
        other.entity_key = "BIS:Acme Corp".into();
        store.upsert_entity(&other).await.unwrap();

        let filter = EntityFilter {
            source: Some("OFAC".into()),
            country: Some("ru".into()),
            limit: None,
        };
        let found = store.list_entities(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_key, "OFAC:Acme Corp");

        let all = store.list_entities(&EntityFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
