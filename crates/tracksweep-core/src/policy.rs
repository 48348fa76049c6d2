//! Retention policy evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;
use crate::run::{LifecycleState, Run, RunTimestamp};

/// Minimum age a run must reach before it may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub min_age: Duration,
}

impl RetentionPolicy {
    pub fn new(min_age: Duration) -> Self {
        Self { min_age }
    }

    pub fn is_eligible(&self, run: &Run, now: DateTime<Utc>) -> bool {
        is_eligible(run, self, now)
    }
}

/// Where the collector reads the policy from at the start of every pass.
pub trait PolicySource: Send + Sync {
    fn current(&self) -> Result<RetentionPolicy>;
}

impl PolicySource for RetentionPolicy {
    fn current(&self) -> Result<RetentionPolicy> {
        Ok(*self)
    }
}

/// Age is measured from the end of the run, or its creation if it never ended.
pub fn reference_time(run: &Run) -> RunTimestamp {
    run.ended_at.unwrap_or(run.created_at)
}

/// Whether `run` has outlived the retention window at `now`.
///
/// Never fails: an unrepresentable timestamp or window makes the run
/// ineligible so one bad record cannot stall a pass.
pub fn is_eligible(run: &Run, policy: &RetentionPolicy, now: DateTime<Utc>) -> bool {
    if run.state == LifecycleState::Purged {
        return false;
    }

    let Some(reference) = reference_time(run).to_datetime() else {
        return false;
    };
    let Ok(min_age) = chrono::Duration::from_std(policy.min_age) else {
        return false;
    };

    now.signed_duration_since(reference) >= min_age
}
