//! Per-source ingestion runs and the invocation that coordinates them.
//!
//! Every source gets its own [`IngestionRun`], created `running` and finalized exactly
//! once as `ok` or `error`. Failures are contained at the source boundary: one
//! publisher going down never prevents the others from being attempted.

use crate::checksum::digest;
use crate::config::{Config, SourceConfig};
use crate::detector::ChangeDetector;
use crate::error::{Result, WatchError};
use crate::fetcher::Fetcher;
use crate::metrics::IngestMetrics;
use crate::parser::parser_for;
use crate::storage::Storage;
use crate::types::{IngestionRun, RunStatus};
use crate::upserter::EntityUpserter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Outcome of one source within an invocation
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub rows: u64,
    pub skipped: u64,
    pub checksum: Option<String>,
    /// Whether the payload differed from the previous snapshot
    pub changed: bool,
    pub error: Option<String>,
}

impl SourceReport {
    fn failed(source: &str, run_id: Option<Uuid>, error: String) -> Self {
        Self {
            source: source.to_string(),
            run_id,
            status: RunStatus::Error,
            rows: 0,
            skipped: 0,
            checksum: None,
            changed: false,
            error: Some(error),
        }
    }
}

/// Partial-success summary for one invocation across all configured sources
#[derive(Debug, Clone, Serialize)]
pub struct InvocationSummary {
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: usize,
    pub failed: usize,
    pub sources: Vec<SourceReport>,
}

#[derive(Debug, Clone, Default)]
struct Progress {
    rows: u64,
    skipped: u64,
    checksum: Option<String>,
    changed: bool,
}

/// Scoped ownership of a `running` run record.
///
/// The run is finalized through [`RunGuard::finish`]; if the guard is dropped first
/// (task aborted, caller went away) it finalizes the run as `error` on its own.
struct RunGuard {
    storage: Arc<dyn Storage>,
    run: Option<IngestionRun>,
    progress: Progress,
    started: Instant,
}

impl RunGuard {
    fn new(storage: Arc<dyn Storage>, run: IngestionRun) -> Self {
        Self {
            storage,
            run: Some(run),
            progress: Progress::default(),
            started: Instant::now(),
        }
    }

    async fn finish(mut self, outcome: Result<()>) -> SourceReport {
        let progress = self.progress.clone();
        let Some(mut run) = self.run.clone() else {
            return SourceReport::failed("unknown", None, "run already finalized".into());
        };
        match &outcome {
            Ok(()) => {
                let checksum = progress.checksum.clone().unwrap_or_default();
                run.finish_ok(progress.rows, checksum);
            }
            Err(e) => {
                run.finish_error(
                    progress.rows,
                    progress.checksum.clone(),
                    format!("{}: {}", e.kind(), e),
                );
            }
        }

        if let Err(e) = self.storage.update_run(&run).await {
            error!(run_id = ?run.id, error = %e, "failed to finalize run");
            // Leave the record to Drop, which retries as an error
            if let Some(held) = self.run.as_mut() {
                held.error = Some(format!("storage: failed to finalize run: {e}"));
            }
            return SourceReport {
                source: run.source.clone(),
                run_id: run.id,
                status: RunStatus::Error,
                rows: progress.rows,
                skipped: progress.skipped,
                checksum: progress.checksum,
                changed: progress.changed,
                error: Some(format!("storage: failed to finalize run: {e}")),
            };
        }
        self.run = None;

        IngestMetrics::record_run_finished(&run.source, run.status, self.started.elapsed().as_secs_f64());
        SourceReport {
            source: run.source,
            run_id: run.id,
            status: run.status,
            rows: run.rows,
            skipped: progress.skipped,
            checksum: run.checksum,
            changed: progress.changed,
            error: run.error,
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        let reason = run
            .error
            .take()
            .unwrap_or_else(|| "cancelled: run abandoned before completion".to_string());
        run.finish_error(self.progress.rows, self.progress.checksum.clone(), reason);
        warn!(run_id = ?run.id, source = %run.source, "finalizing abandoned run as error");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let storage = self.storage.clone();
                handle.spawn(async move {
                    if let Err(e) = storage.update_run(&run).await {
                        error!(run_id = ?run.id, error = %e, "could not finalize abandoned run");
                    }
                });
            }
            Err(_) => error!(run_id = ?run.id, "no runtime available to finalize abandoned run"),
        }
    }
}

/// Runs created during one invocation, so abandoned ones can be swept afterwards
#[derive(Clone, Default)]
struct RunTracker(Arc<Mutex<Vec<(String, Uuid)>>>);

impl RunTracker {
    fn record(&self, source: &str, id: Uuid) {
        if let Ok(mut runs) = self.0.lock() {
            runs.push((source.to_string(), id));
        }
    }

    fn entries(&self) -> Vec<(String, Uuid)> {
        self.0.lock().map(|runs| runs.clone()).unwrap_or_default()
    }
}

/// Coordinates fetch, change detection, parsing and upsert for each configured source
#[derive(Clone)]
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn Fetcher>,
    detector: Arc<ChangeDetector>,
    upserter: Arc<EntityUpserter>,
    parallel: bool,
    deadline: Option<Duration>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("storage", &"<Arc<dyn Storage>>")
            .field("fetcher", &"<Arc<dyn Fetcher>>")
            .field("parallel", &self.parallel)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(storage: Arc<dyn Storage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            detector: Arc::new(ChangeDetector::new(storage.clone())),
            upserter: Arc::new(EntityUpserter::new(storage.clone())),
            storage,
            fetcher,
            parallel: true,
            deadline: None,
        }
    }

    pub fn from_config(config: &Config, storage: Arc<dyn Storage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::new(storage, fetcher)
            .with_parallel(config.parallel)
            .with_deadline(config.invocation_deadline_secs.map(Duration::from_secs))
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run every source once.
    ///
    /// Per-source failures are reported in the summary. `Err` is returned only when
    /// no run record could be created at all, i.e. storage is unreachable.
    pub async fn run_all(&self, sources: &[SourceConfig]) -> Result<InvocationSummary> {
        let started_at = Utc::now();
        let deadline = self.deadline.map(|d| tokio::time::Instant::now() + d);
        let tracker = RunTracker::default();
        info!(sources = sources.len(), parallel = self.parallel, "starting ingestion invocation");

        let mut reports = Vec::with_capacity(sources.len());
        if self.parallel {
            let handles: Vec<_> = sources
                .iter()
                .map(|s| (s.id.clone(), self.spawn_source(s.clone(), tracker.clone())))
                .collect();
            for (id, handle) in handles {
                reports.push(join_source(id, handle, deadline).await);
            }
        } else {
            for source in sources {
                if deadline.map_or(false, |at| tokio::time::Instant::now() >= at) {
                    reports.push(SourceReport::failed(
                        &source.id,
                        None,
                        "cancelled: invocation deadline exceeded before start".into(),
                    ));
                    continue;
                }
                let handle = self.spawn_source(source.clone(), tracker.clone());
                reports.push(join_source(source.id.clone(), handle, deadline).await);
            }
        }

        self.sweep_abandoned(&tracker, &mut reports).await;

        if !sources.is_empty() && tracker.entries().is_empty() {
            let detail = reports
                .iter()
                .filter_map(|r| r.error.as_deref())
                .next()
                .unwrap_or("no run record could be created")
                .to_string();
            return Err(WatchError::Storage(detail));
        }

        let ok = reports.iter().filter(|r| r.status == RunStatus::Ok).count();
        let failed = reports.len() - ok;
        let summary = InvocationSummary {
            success: failed == 0,
            started_at,
            finished_at: Utc::now(),
            ok,
            failed,
            sources: reports,
        };
        info!(ok, failed, "ingestion invocation finished");
        Ok(summary)
    }

    fn spawn_source(&self, source: SourceConfig, tracker: RunTracker) -> JoinHandle<SourceReport> {
        let orchestrator = self.clone();
        let span = info_span!("ingest_source", source = %source.id);
        tokio::spawn(
            async move { orchestrator.run_tracked(&source, Some(&tracker)).await }.instrument(span),
        )
    }

    /// Ingest a single source inside its own run record
    pub async fn run_source(&self, source: &SourceConfig) -> SourceReport {
        self.run_tracked(source, None).await
    }

    async fn run_tracked(&self, source: &SourceConfig, tracker: Option<&RunTracker>) -> SourceReport {
        let mut run = IngestionRun::new(&source.id);
        if let Err(e) = self.storage.create_run(&mut run).await {
            error!(source = %source.id, error = %e, "could not create run record");
            return SourceReport::failed(
                &source.id,
                None,
                format!("storage: could not create run record: {e}"),
            );
        }
        if let (Some(tracker), Some(id)) = (tracker, run.id) {
            tracker.record(&source.id, id);
        }
        info!(run_id = ?run.id, "run started");

        let mut guard = RunGuard::new(self.storage.clone(), run);
        let outcome = self.ingest(source, &mut guard.progress).await;
        if let Err(e) = &outcome {
            warn!(source = %source.id, error = %e, rows = guard.progress.rows, "ingestion failed");
        }
        guard.finish(outcome).await
    }

    #[instrument(skip(self, source, progress), fields(source = %source.id))]
    async fn ingest(&self, source: &SourceConfig, progress: &mut Progress) -> Result<()> {
        let content = self.fetcher.fetch(source).await?;
        let checksum = digest(&content.bytes);
        progress.checksum = Some(checksum.clone());

        let detection = self
            .detector
            .detect_with_checksum(&source.id, &content, checksum)
            .await?;
        progress.changed = detection.is_new;

        let parser = parser_for(source.parser, &source.id, source.delimiter);
        let parsed = parser.parse(&content.bytes)?;
        progress.skipped = parsed.skipped as u64;

        for candidate in &parsed.candidates {
            self.upserter.upsert(candidate, source).await?;
            progress.rows += 1;
        }
        IngestMetrics::record_entities(&source.id, parsed.candidates.len(), parsed.skipped);

        info!(
            rows = progress.rows,
            skipped = progress.skipped,
            changed = progress.changed,
            "source ingested"
        );
        Ok(())
    }

    /// Finalize any run of this invocation still marked `running` (aborted tasks)
    async fn sweep_abandoned(&self, tracker: &RunTracker, reports: &mut [SourceReport]) {
        for (source, id) in tracker.entries() {
            if let Some(report) = reports
                .iter_mut()
                .find(|r| r.source == source && r.run_id.is_none())
            {
                report.run_id = Some(id);
            }

            let mut run = match self.storage.get_run(id).await {
                Ok(Some(run)) if run.status == RunStatus::Running => run,
                Ok(_) => continue,
                Err(e) => {
                    error!(run_id = %id, error = %e, "could not check run state");
                    continue;
                }
            };
            let reason = "cancelled: invocation deadline exceeded".to_string();
            run.finish_error(run.rows, run.checksum.clone(), reason);
            match self.storage.update_run(&run).await {
                Ok(()) => warn!(run_id = %id, source = %source, "swept abandoned run to error"),
                Err(e) => error!(run_id = %id, error = %e, "could not sweep abandoned run"),
            }
        }
    }
}

async fn join_source(
    source: String,
    mut handle: JoinHandle<SourceReport>,
    deadline: Option<tokio::time::Instant>,
) -> SourceReport {
    let joined = match deadline {
        Some(at) => match tokio::time::timeout_at(at, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(source = %source, "invocation deadline exceeded, aborting source");
                handle.abort();
                match handle.await {
                    Ok(report) => return report,
                    Err(_) => {
                        return SourceReport::failed(
                            &source,
                            None,
                            "cancelled: invocation deadline exceeded".into(),
                        )
                    }
                }
            }
        },
        None => handle.await,
    };
    joined.unwrap_or_else(|e| {
        error!(source = %source, error = %e, "source task failed");
        SourceReport::failed(&source, None, format!("task failed: {e}"))
    })
}
