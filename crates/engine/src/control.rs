//! Per-run control state.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use archflow_execution::{FlowResult, FlowStatus};

/// Snapshot of a run's progress, as served by the status endpoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// Current status.
    pub status: FlowStatus,
    /// Steps that completed, in completion order.
    pub completed_steps: Vec<String>,
    /// Steps that failed, in failure order.
    pub failed_steps: Vec<String>,
}

#[derive(Debug)]
struct Progress {
    status: FlowStatus,
    completed_steps: Vec<String>,
    failed_steps: Vec<String>,
    terminal: Option<FlowResult>,
}

/// Shared control block for one run.
///
/// `pause` blocks the next scheduling tick (in-flight steps complete);
/// `stop` trips the cancellation token so in-flight steps are cancelled
/// best-effort.
#[derive(Debug)]
pub struct RunControl {
    run_id: String,
    paused: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
    changed: Notify,
    done: Notify,
}

impl RunControl {
    /// Create a control block for `run_id` sharing the run's cancel token.
    #[must_use]
    pub fn new(run_id: String, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel,
            progress: Mutex::new(Progress {
                status: FlowStatus::Running,
                completed_steps: Vec::new(),
                failed_steps: Vec::new(),
                terminal: None,
            }),
            changed: Notify::new(),
            done: Notify::new(),
        }
    }

    /// The run this block controls.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request a pause. Idempotent.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Release a pause. Idempotent.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Request a stop: cancels in-flight steps. Idempotent.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cancel.cancel();
        self.changed.notify_waiters();
    }

    /// Whether a pause is requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether a stop is requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait until a control flag changes.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Park until the pause is released (or a stop arrives). Registers the
    /// waiter before re-checking the flags, so a concurrent unpause cannot
    /// be missed.
    pub async fn wait_while_paused(&self) {
        loop {
            let wait = self.changed.notified();
            if !self.is_paused() || self.is_stopped() {
                return;
            }
            wait.await;
        }
    }

    /// Record a completed step.
    pub fn note_completed(&self, step_id: &str) {
        self.progress.lock().completed_steps.push(step_id.to_owned());
    }

    /// Record a failed step.
    pub fn note_failed(&self, step_id: &str) {
        self.progress.lock().failed_steps.push(step_id.to_owned());
    }

    /// Update the visible status.
    pub fn set_status(&self, status: FlowStatus) {
        self.progress.lock().status = status;
    }

    /// Snapshot for the status endpoint.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        let progress = self.progress.lock();
        RunStatus {
            status: progress.status,
            completed_steps: progress.completed_steps.clone(),
            failed_steps: progress.failed_steps.clone(),
        }
    }

    /// Record the run's final result and wake `wait_result` callers.
    pub fn set_result(&self, result: FlowResult) {
        {
            let mut progress = self.progress.lock();
            progress.status = result.status;
            progress.terminal = Some(result);
        }
        self.done.notify_waiters();
    }

    /// The final result, when the run has produced one.
    #[must_use]
    pub fn result(&self) -> Option<FlowResult> {
        self.progress.lock().terminal.clone()
    }

    /// Wait for the run to produce its final result.
    pub async fn wait_result(&self) -> FlowResult {
        loop {
            let wait = self.done.notified();
            if let Some(result) = self.result() {
                return result;
            }
            wait.await;
        }
    }
}
