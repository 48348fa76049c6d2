//! Background task running collector passes at a fixed interval.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{Collector, GcPassResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// What observers see of the scheduler. Only the scheduler task writes it.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub enabled: bool,
    /// True while a pass is executing.
    pub in_pass: bool,
    pub passes: u64,
    pub last_pass: Option<GcPassResult>,
    pub last_error: Option<String>,
}

impl SchedulerStatus {
    fn stopped(enabled: bool) -> Self {
        Self {
            state: SchedulerState::Stopped,
            enabled,
            in_pass: false,
            passes: 0,
            last_pass: None,
            last_error: None,
        }
    }
}

pub struct GcScheduler {
    collector: Collector,
    interval: Duration,
}

impl GcScheduler {
    pub fn new(collector: Collector, interval: Duration) -> Self {
        Self {
            collector,
            interval,
        }
    }

    /// Spawn the scheduling task. The first pass starts immediately.
    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(SchedulerStatus::stopped(true));
        let task = tokio::spawn(run_loop(
            self.collector,
            self.interval,
            cancel.clone(),
            tx,
        ));

        SchedulerHandle {
            status: rx,
            cancel,
            task: Some(task),
        }
    }

    /// Handle for a scheduler turned off by configuration. No task runs.
    pub fn disabled() -> SchedulerHandle {
        info!("GC disabled by configuration");
        let (_tx, rx) = watch::channel(SchedulerStatus::stopped(false));
        SchedulerHandle {
            status: rx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

async fn run_loop(
    mut collector: Collector,
    interval: Duration,
    cancel: CancellationToken,
    status: watch::Sender<SchedulerStatus>,
) {
    info!(interval_secs = interval.as_secs(), "GC scheduler started");
    status.send_modify(|s| s.state = SchedulerState::Running);

    while !cancel.is_cancelled() {
        status.send_modify(|s| s.in_pass = true);
        let outcome = collector.run_pass(&cancel).await;

        status.send_modify(|s| {
            s.in_pass = false;
            s.passes += 1;
            match outcome {
                Ok(result) => {
                    s.last_pass = Some(result);
                    s.last_error = None;
                }
                Err(aborted) => {
                    warn!(
                        error = %aborted.source,
                        retry_in_secs = interval.as_secs(),
                        "GC pass aborted, retrying after the interval"
                    );
                    s.last_error = Some(aborted.source.to_string());
                    s.last_pass = Some(aborted.partial);
                }
            }
        });

        // The next pass starts an interval after this one finished.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    status.send_modify(|s| s.state = SchedulerState::Stopped);
    info!("GC scheduler stopped");
}

/// Owner's handle on a running (or disabled) scheduler.
pub struct SchedulerHandle {
    status: watch::Receiver<SchedulerStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Read-only view for other tasks such as the health endpoint.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.task.is_some()
    }

    /// Stop after the run in flight and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "GC scheduler task failed");
            }
        }
    }
}
