//! In-memory stores that record every call, for collector and scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracksweep_core::{
    ArtifactStore, DeletionOutcome, Error, LifecycleState, Result, Run, RunFilter, RunId,
    RunStore, RunTimestamp, StorageLocation,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SoftDelete(RunId),
    DeleteTree(RunId),
    Purge(RunId),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub fn artifact_uri(id: &str) -> String {
    format!("gs://bucket/mlflow-artifacts-v1/0/{}/artifacts", id)
}

/// Run id encoded in `artifact_uri`.
fn run_of(location: &StorageLocation) -> RunId {
    match location {
        StorageLocation::Gcs { prefix, .. } => {
            RunId::new(prefix.split('/').rev().nth(1).unwrap_or_default())
        }
        other => RunId::new(other.to_string()),
    }
}

pub fn run(
    id: &str,
    state: LifecycleState,
    created: DateTime<Utc>,
    ended: Option<DateTime<Utc>>,
) -> Run {
    Run {
        id: RunId::new(id),
        state,
        created_at: RunTimestamp::from_datetime(created),
        ended_at: ended.map(RunTimestamp::from_datetime),
        artifact_uri: Some(artifact_uri(id)),
    }
}

#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<BTreeMap<RunId, Run>>,
    malformed: Mutex<Vec<String>>,
    pub log: CallLog,
    pub unavailable: AtomicBool,
}

impl MemoryRunStore {
    pub fn new(log: CallLog, runs: impl IntoIterator<Item = Run>) -> Self {
        Self {
            runs: Mutex::new(runs.into_iter().map(|r| (r.id.clone(), r)).collect()),
            log,
            ..Default::default()
        }
    }

    pub fn add_malformed(&self, id: &str) {
        self.malformed.lock().unwrap().push(id.to_string());
    }

    pub fn state(&self, id: &str) -> LifecycleState {
        self.runs.lock().unwrap()[&RunId::new(id)].state
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    fn list_runs(&self, filter: RunFilter) -> BoxStream<'_, Result<Run>> {
        if let Err(e) = self.check() {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let mut items: Vec<Result<Run>> = self
            .malformed
            .lock()
            .unwrap()
            .iter()
            .map(|id| Err(Error::MalformedRecord(format!("run {} has no start time", id))))
            .collect();
        items.extend(
            self.runs
                .lock()
                .unwrap()
                .values()
                .filter(|r| filter.matches(r.state))
                .cloned()
                .map(Ok),
        );
        stream::iter(items).boxed()
    }

    async fn soft_delete(&self, run_id: &RunId) -> Result<()> {
        self.check()?;
        self.log.lock().unwrap().push(Call::SoftDelete(run_id.clone()));
        let mut runs = self.runs.lock().unwrap();
        match runs.get_mut(run_id) {
            Some(run) if run.state != LifecycleState::Purged => {
                run.state = LifecycleState::Deleted;
                Ok(())
            }
            _ => Err(Error::NotFound(run_id.to_string())),
        }
    }

    async fn purge(&self, run_id: &RunId) -> Result<()> {
        self.check()?;
        self.log.lock().unwrap().push(Call::Purge(run_id.clone()));
        let mut runs = self.runs.lock().unwrap();
        match runs.get_mut(run_id) {
            Some(run) if run.state == LifecycleState::Deleted => {
                run.state = LifecycleState::Purged;
                Ok(())
            }
            _ => Err(Error::NotFound(run_id.to_string())),
        }
    }
}

/// Artifact store answering from per-run scripts, `Deleted` otherwise.
#[derive(Default)]
pub struct ScriptedArtifactStore {
    scripts: Mutex<HashMap<RunId, VecDeque<Result<DeletionOutcome>>>>,
    pub log: CallLog,
    pub delay: Option<Duration>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedArtifactStore {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(&self, id: &str, results: impl IntoIterator<Item = Result<DeletionOutcome>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(RunId::new(id))
            .or_default()
            .extend(results);
    }
}

#[async_trait]
impl ArtifactStore for ScriptedArtifactStore {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn delete_tree(&self, location: &StorageLocation) -> Result<DeletionOutcome> {
        let run_id = run_of(location);
        self.log.lock().unwrap().push(Call::DeleteTree(run_id.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.scripts
            .lock()
            .unwrap()
            .get_mut(&run_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(DeletionOutcome::Deleted { objects: 1 }))
    }
}
