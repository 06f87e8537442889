//! Batch-job state machine and cooperative control.
//!
//! One [`JobControl`] exists per batch job. Its phase moves through
//! `running ↔ paused → cancelling`; `idle` is represented by the engine
//! holding no active job. Workers call [`JobControl::checkpoint`] between
//! pages: it parks them while paused and fails fast once cancelling. The
//! embedded [`CancellationToken`] is the same context every blocking layer
//! (rate limiter, HTTP call, single-flight wait) observes.

use crate::error::PageFailure;
use crate::events::JobStatus;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What a batch job does per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    /// Recognition only.
    Ocr,
    /// Transformation of existing page text.
    Ai,
    /// Recognition immediately followed by transformation.
    OcrAi,
}

/// Non-idle phases of the active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Running,
    Paused,
    Cancelling,
}

impl JobPhase {
    pub fn status(self) -> JobStatus {
        match self {
            JobPhase::Running => JobStatus::Running,
            JobPhase::Paused => JobStatus::Paused,
            JobPhase::Cancelling => JobStatus::Cancelling,
        }
    }
}

/// Serializable snapshot of the engine's job state for the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateSnapshot {
    pub job_id: u64,
    pub selected_pages: Vec<u32>,
    pub mode: JobMode,
    pub force_reprocess: bool,
    pub context_mode: bool,
    pub state: JobStatus,
    pub processed_count: usize,
    pub current_page: u32,
}

/// Shared control block for one batch job.
pub struct JobControl {
    phase: Mutex<JobPhase>,
    resumed: Notify,
    cancel: CancellationToken,
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(JobPhase::Running),
            resumed: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.lock().expect("job phase lock poisoned")
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `running → paused`. Returns whether the transition happened.
    pub fn pause(&self) -> bool {
        let mut phase = self.phase.lock().expect("job phase lock poisoned");
        if *phase == JobPhase::Running {
            *phase = JobPhase::Paused;
            true
        } else {
            false
        }
    }

    /// `paused → running`, waking parked workers.
    pub fn resume(&self) -> bool {
        let mut phase = self.phase.lock().expect("job phase lock poisoned");
        if *phase == JobPhase::Paused {
            *phase = JobPhase::Running;
            drop(phase);
            self.resumed.notify_waiters();
            true
        } else {
            false
        }
    }

    /// `running | paused → cancelling`, cancelling the job context so every
    /// blocking layer unwinds. Also wakes parked workers so they can
    /// observe the cancellation.
    pub fn cancel(&self) -> bool {
        let mut phase = self.phase.lock().expect("job phase lock poisoned");
        match *phase {
            JobPhase::Running | JobPhase::Paused => {
                *phase = JobPhase::Cancelling;
                drop(phase);
                self.cancel.cancel();
                self.resumed.notify_waiters();
                true
            }
            JobPhase::Cancelling => false,
        }
    }

    /// Called by workers between pages: parks while paused, errors once
    /// cancelling.
    pub async fn checkpoint(&self, page: u32) -> Result<(), PageFailure> {
        loop {
            // Arm the notification before re-reading the phase so a resume
            // between the check and the await cannot be missed.
            let resumed = self.resumed.notified();
            match self.phase() {
                JobPhase::Running => return Ok(()),
                JobPhase::Cancelling => return Err(PageFailure::cancelled(page)),
                JobPhase::Paused => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(PageFailure::cancelled(page)),
                        _ = resumed => {}
                    }
                }
            }
        }
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}
