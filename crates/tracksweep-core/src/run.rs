//! Tracked runs and the metadata store port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result, RunId};

/// Lifecycle of a run as seen by the retention process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Active,
    /// Soft-deleted: pending permanent removal.
    Deleted,
    /// Metadata permanently removed.
    Purged,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Deleted => "deleted",
            LifecycleState::Purged => "purged",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "deleted" => Ok(LifecycleState::Deleted),
            "purged" => Ok(LifecycleState::Purged),
            other => Err(Error::MalformedRecord(format!(
                "unknown lifecycle stage '{}'",
                other
            ))),
        }
    }
}

/// Milliseconds since the Unix epoch, as stored by the tracking backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunTimestamp(i64);

impl RunTimestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// `None` when the value cannot be represented as a UTC instant.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

/// One tracked execution of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub state: LifecycleState,
    pub created_at: RunTimestamp,
    /// Absent while the run is still executing.
    pub ended_at: Option<RunTimestamp>,
    /// URI of the run's artifact root.
    pub artifact_uri: Option<String>,
}

/// Lifecycle-state filter for run listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub states: Vec<LifecycleState>,
}

impl RunFilter {
    pub fn new(states: impl IntoIterator<Item = LifecycleState>) -> Self {
        Self {
            states: states.into_iter().collect(),
        }
    }

    /// Runs the retention process may act on. Purged runs are never rescanned.
    pub fn collectable() -> Self {
        Self::new([LifecycleState::Active, LifecycleState::Deleted])
    }

    pub fn matches(&self, state: LifecycleState) -> bool {
        self.states.contains(&state)
    }
}

/// Trait for tracking backends holding run metadata.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Lazily list every run matching the filter, page by page.
    ///
    /// A record that cannot be decoded yields one `Error::MalformedRecord`
    /// item and the stream continues. Any other error item ends the stream.
    fn list_runs(&self, filter: RunFilter) -> BoxStream<'_, Result<Run>>;

    /// Mark a run as deleted. Deleting a deleted run succeeds.
    async fn soft_delete(&self, run_id: &RunId) -> Result<()>;

    /// Permanently remove a run's metadata.
    /// Returns `Error::NotFound` when the run is already gone.
    async fn purge(&self, run_id: &RunId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_round_trip() {
        for state in [
            LifecycleState::Active,
            LifecycleState::Deleted,
            LifecycleState::Purged,
        ] {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_lifecycle_is_malformed() {
        let err = "archived".parse::<LifecycleState>().unwrap_err();
        assert!(matches!(err, Error::MalformedRecord(_)));
    }

    #[test]
    fn test_timestamp_out_of_range() {
        assert!(RunTimestamp::from_millis(i64::MAX).to_datetime().is_none());
        assert!(RunTimestamp::from_millis(0).to_datetime().is_some());
    }

    #[test]
    fn test_collectable_filter_excludes_purged() {
        let filter = RunFilter::collectable();
        assert!(filter.matches(LifecycleState::Active));
        assert!(filter.matches(LifecycleState::Deleted));
        assert!(!filter.matches(LifecycleState::Purged));
    }
}
