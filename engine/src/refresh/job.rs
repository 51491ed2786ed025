//! Single-slot job state for refresh runs
//!
//! The orchestrator owns one [`JobSlot`]. Starting a run takes the slot and
//! yields a [`JobGuard`]; a second start while the guard is alive is
//! rejected, never queued. Dropping the guard frees the slot, including on
//! early return or panic.

use super::{RefreshMode, RefreshReport};
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Observable state of the refresh job
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStatus {
    pub is_processing: bool,
    pub run_id: Option<String>,
    pub mode: Option<RefreshMode>,
    pub current_task: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<RefreshReport>,
}

/// The one refresh slot
#[derive(Clone)]
pub struct JobSlot {
    state: Arc<Mutex<RefreshStatus>>,
    clock: Arc<dyn Clock>,
}

impl JobSlot {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshStatus::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshStatus> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the slot for a `mode` run
    pub fn try_acquire(&self, mode: RefreshMode) -> Result<JobGuard, EngineError> {
        let mut state = self.lock();

        if state.is_processing {
            let running = state.mode.unwrap_or(mode);
            warn!(
                "Rejected {} refresh: a {} refresh is already running",
                mode, running
            );
            return Err(EngineError::ConcurrentRefreshRejected {
                running: running.to_string(),
            });
        }

        let now = self.clock.now();
        let run_id = uuid::Uuid::new_v4().to_string();
        state.is_processing = true;
        state.run_id = Some(run_id.clone());
        state.mode = Some(mode);
        state.current_task = Some("starting".to_string());
        state.started_at = Some(now);
        state.last_update = Some(now);
        state.last_error = None;

        Ok(JobGuard {
            slot: self.clone(),
            run_id,
            mode,
            finished: false,
        })
    }

    pub fn snapshot(&self) -> RefreshStatus {
        self.lock().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().is_processing
    }
}

/// Holds the refresh slot for the lifetime of one run
pub struct JobGuard {
    slot: JobSlot,
    run_id: String,
    mode: RefreshMode,
    finished: bool,
}

impl JobGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn mode(&self) -> RefreshMode {
        self.mode
    }

    pub fn set_task(&self, task: impl Into<String>) {
        let now = self.slot.clock.now();
        let mut state = self.slot.lock();
        state.current_task = Some(task.into());
        state.last_update = Some(now);
    }

    /// Release the slot and record a successful run
    pub fn finish(mut self, report: RefreshReport) {
        self.release(Some(report), None);
    }

    /// Release the slot and record a failed run
    pub fn fail(mut self, error: &EngineError) {
        self.release(None, Some(error.to_string()));
    }

    fn release(&mut self, report: Option<RefreshReport>, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let now = self.slot.clock.now();
        let mut state = self.slot.lock();
        state.is_processing = false;
        state.current_task = None;
        state.last_update = Some(now);
        state.last_error = error;
        if report.is_some() {
            state.last_report = report;
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Refresh run {} ended without a result", self.run_id);
            self.release(None, Some("refresh ended unexpectedly".to_string()));
        }
    }
}
