//! One garbage-collection pass over the tracking backend.
//!
//! Eligible runs are removed in two phases: artifacts first, metadata
//! second. An `active` run is soft-deleted before anything else so a crash
//! at any later point leaves it discoverable as `deleted` on the next pass.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracksweep_core::{
    ArtifactStore, DeletionOutcome, Error, LifecycleState, PolicySource, Result, RetentionPolicy,
    Run, RunFilter, RunId, RunStore, StorageLocation,
};
use uuid::Uuid;

/// Summary of one pass. Logged once, kept in memory by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcPassResult {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub aborted: bool,
    pub cancelled: bool,
    pub scanned: u64,
    pub eligible: u64,
    pub soft_deleted: u64,
    pub malformed: u64,
    pub artifacts_deleted: u64,
    pub artifacts_failed: u64,
    pub metadata_purged: u64,
    pub metadata_failed: u64,
    /// Runs left `deleted` with some of their artifacts or metadata still present.
    pub partially_deleted: Vec<RunId>,
}

impl GcPassResult {
    fn new(started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            pass_id: Uuid::now_v7(),
            started_at,
            duration_ms: 0,
            dry_run,
            aborted: false,
            cancelled: false,
            scanned: 0,
            eligible: 0,
            soft_deleted: 0,
            malformed: 0,
            artifacts_deleted: 0,
            artifacts_failed: 0,
            metadata_purged: 0,
            metadata_failed: 0,
            partially_deleted: Vec::new(),
        }
    }
}

/// A pass that stopped early. `partial` holds what was done before the error.
#[derive(Debug, thiserror::Error)]
#[error("gc pass aborted: {source}")]
pub struct PassAborted {
    pub partial: GcPassResult,
    pub source: Error,
}

/// Errors that make the rest of the pass pointless: the backend is gone or
/// credentials were rejected.
fn is_pass_fatal(e: &Error) -> bool {
    matches!(
        e,
        Error::Auth(_) | Error::BackendUnavailable(_) | Error::Timeout(_)
    )
}

pub struct Collector {
    runs: Arc<dyn RunStore>,
    artifacts: Arc<dyn ArtifactStore>,
    policy: Arc<dyn PolicySource>,
    call_timeout: Duration,
    dry_run: bool,
    last_policy: Option<RetentionPolicy>,
}

impl Collector {
    pub fn new(
        runs: Arc<dyn RunStore>,
        artifacts: Arc<dyn ArtifactStore>,
        policy: Arc<dyn PolicySource>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            runs,
            artifacts,
            policy,
            call_timeout,
            dry_run: false,
            last_policy: None,
        }
    }

    /// Evaluate and count without touching either store.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run_pass(
        &mut self,
        cancel: &CancellationToken,
    ) -> std::result::Result<GcPassResult, PassAborted> {
        self.run_pass_at(Utc::now(), cancel).await
    }

    /// Run one pass, judging eligibility against `now`.
    pub async fn run_pass_at(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> std::result::Result<GcPassResult, PassAborted> {
        let started = Instant::now();
        let mut result = GcPassResult::new(now, self.dry_run);

        let outcome = self.collect(now, cancel, &mut result).await;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(()) => {
                log_summary(&result, None);
                Ok(result)
            }
            Err(source) => {
                result.aborted = true;
                log_summary(&result, Some(&source));
                Err(PassAborted {
                    partial: result,
                    source,
                })
            }
        }
    }

    /// The policy for this pass. A source that fails keeps the previous one.
    fn refresh_policy(&mut self) -> Result<RetentionPolicy> {
        match self.policy.current() {
            Ok(policy) => {
                if self.last_policy != Some(policy) {
                    info!(min_age_secs = policy.min_age.as_secs(), "Loaded retention policy");
                }
                self.last_policy = Some(policy);
                Ok(policy)
            }
            Err(e) => match self.last_policy {
                Some(previous) => {
                    warn!(error = %e, "Failed to reload retention policy, keeping previous");
                    Ok(previous)
                }
                None => Err(e),
            },
        }
    }

    async fn bounded<T>(&self, call: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} did not finish within {:?}",
                call, self.call_timeout
            ))),
        }
    }

    async fn collect(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        result: &mut GcPassResult,
    ) -> Result<()> {
        let policy = self.refresh_policy()?;
        let runs = Arc::clone(&self.runs);
        let mut listing = runs.list_runs(RunFilter::collectable());

        loop {
            // Only checked between runs so an in-flight run always completes.
            if cancel.is_cancelled() {
                info!(pass_id = %result.pass_id, "GC pass cancelled");
                result.cancelled = true;
                return Ok(());
            }

            let Some(item) = self.bounded("list_runs", async { Ok(listing.next().await) }).await?
            else {
                return Ok(());
            };

            let run = match item {
                Ok(run) => run,
                Err(Error::MalformedRecord(reason)) => {
                    warn!(reason = %reason, "Skipping malformed run record");
                    result.malformed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            result.scanned += 1;
            if !policy.is_eligible(&run, now) {
                continue;
            }
            result.eligible += 1;

            if self.dry_run {
                info!(run_id = %run.id, state = %run.state, "Run eligible for deletion (dry run)");
                continue;
            }

            self.collect_run(&run, result).await?;
        }
    }

    /// Soft-delete, delete artifacts, purge. `Err` aborts the pass.
    async fn collect_run(&self, run: &Run, result: &mut GcPassResult) -> Result<()> {
        if run.state == LifecycleState::Active {
            match self.bounded("soft_delete", self.runs.soft_delete(&run.id)).await {
                Ok(()) => {
                    debug!(run_id = %run.id, "Soft-deleted run");
                    result.soft_deleted += 1;
                }
                Err(e) if e.is_not_found() => {
                    debug!(run_id = %run.id, "Run vanished before soft delete");
                    return Ok(());
                }
                Err(e) if is_pass_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Failed to soft-delete run");
                    result.metadata_failed += 1;
                    return Ok(());
                }
            }
        }

        let outcome = match self.delete_artifacts(run).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_auth() => {
                result.partially_deleted.push(run.id.clone());
                return Err(e);
            }
            Err(e) => DeletionOutcome::PartialFailure {
                remaining: 0,
                reason: e.to_string(),
            },
        };

        match outcome {
            DeletionOutcome::PartialFailure { remaining, reason } => {
                warn!(
                    run_id = %run.id,
                    remaining,
                    reason = %reason,
                    "Artifacts not fully deleted, keeping run for the next pass"
                );
                result.artifacts_failed += 1;
                result.partially_deleted.push(run.id.clone());
                return Ok(());
            }
            DeletionOutcome::Deleted { objects } => {
                debug!(run_id = %run.id, objects, "Deleted run artifacts");
                result.artifacts_deleted += 1;
            }
            DeletionOutcome::AlreadyAbsent => {
                debug!(run_id = %run.id, "Run artifacts already absent");
                result.artifacts_deleted += 1;
            }
        }

        match self.bounded("purge", self.runs.purge(&run.id)).await {
            Ok(()) => {
                info!(run_id = %run.id, "Purged run");
                result.metadata_purged += 1;
            }
            Err(e) if e.is_not_found() => {
                debug!(run_id = %run.id, "Run already purged");
                result.metadata_purged += 1;
            }
            Err(e) => {
                result.partially_deleted.push(run.id.clone());
                if is_pass_fatal(&e) {
                    return Err(e);
                }
                warn!(run_id = %run.id, error = %e, "Failed to purge run");
                result.metadata_failed += 1;
            }
        }
        Ok(())
    }

    async fn delete_artifacts(&self, run: &Run) -> Result<DeletionOutcome> {
        let Some(uri) = &run.artifact_uri else {
            return Ok(DeletionOutcome::AlreadyAbsent);
        };
        let location = StorageLocation::parse(uri)?;
        self.bounded("delete_tree", self.artifacts.delete_tree(&location))
            .await
    }
}

fn log_summary(result: &GcPassResult, error: Option<&Error>) {
    let error = error.map(|e| e.to_string());
    if result.aborted || !result.partially_deleted.is_empty() {
        warn!(
            pass_id = %result.pass_id,
            duration_ms = result.duration_ms,
            dry_run = result.dry_run,
            aborted = result.aborted,
            cancelled = result.cancelled,
            scanned = result.scanned,
            eligible = result.eligible,
            soft_deleted = result.soft_deleted,
            malformed = result.malformed,
            artifacts_deleted = result.artifacts_deleted,
            artifacts_failed = result.artifacts_failed,
            metadata_purged = result.metadata_purged,
            metadata_failed = result.metadata_failed,
            partially_deleted = ?result.partially_deleted,
            error = ?error,
            "GC pass finished with failures"
        );
    } else {
        info!(
            pass_id = %result.pass_id,
            duration_ms = result.duration_ms,
            dry_run = result.dry_run,
            cancelled = result.cancelled,
            scanned = result.scanned,
            eligible = result.eligible,
            soft_deleted = result.soft_deleted,
            malformed = result.malformed,
            artifacts_deleted = result.artifacts_deleted,
            metadata_purged = result.metadata_purged,
            "GC pass finished"
        );
    }
}
