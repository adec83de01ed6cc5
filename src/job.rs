//! Per-job state shared between the engine task and whoever polls it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::BookInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Analyzed,
    Generating,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }

    /// Statuses only move forward; terminal states are final.
    pub fn can_become(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Analyzed => next != JobStatus::Analyzed,
            JobStatus::Generating => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One continuous audio file for the whole book.
    SingleFile,
    /// One audio file per chapter, bundled in a zip archive.
    PerChapter,
}

/// Why a job stopped at a cancellation checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    /// Nobody polled the job within the liveness timeout.
    Abandoned,
}

/// Point-in-time copy of a job's progress, for pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub processed_chars: usize,
    pub total_chars: usize,
    pub bytes_generated: u64,
    pub failed_chunks: usize,
    pub message: String,
    pub current_chapter: Option<usize>,
    pub elapsed_secs: f64,
    pub outputs: Vec<String>,
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total_chars == 0 {
            return 0.0;
        }
        (self.processed_chars as f64 / self.total_chars as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug)]
struct Progress {
    status: JobStatus,
    current_chunk: usize,
    total_chunks: usize,
    processed_chars: usize,
    total_chars: usize,
    bytes_generated: u64,
    failed_chunks: usize,
    message: String,
    current_chapter: Option<usize>,
    started_at: Option<Instant>,
    elapsed: Duration,
    outputs: Vec<String>,
    error: Option<String>,
}

/// One synthesis run over an analyzed book.
///
/// Progress is written only by the engine task; pollers read snapshots.
/// Cancellation has two signals, an explicit flag and the time of the last
/// liveness signal, both evaluated in [`SynthesisJob::cancellation_requested`].
#[derive(Debug)]
pub struct SynthesisJob {
    id: String,
    book: BookInfo,
    progress: Mutex<Progress>,
    cancel_flag: AtomicBool,
    notification: AtomicBool,
    last_seen: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SynthesisJob {
    pub fn new(id: impl Into<String>, book: BookInfo) -> Self {
        Self {
            id: id.into(),
            book,
            progress: Mutex::new(Progress {
                status: JobStatus::Analyzed,
                current_chunk: 0,
                total_chunks: 0,
                processed_chars: 0,
                total_chars: 0,
                bytes_generated: 0,
                failed_chunks: 0,
                message: "Analyzed".to_string(),
                current_chapter: None,
                started_at: None,
                elapsed: Duration::ZERO,
                outputs: Vec::new(),
                error: None,
            }),
            cancel_flag: AtomicBool::new(false),
            notification: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn book(&self) -> &BookInfo {
        &self.book
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.progress).status
    }

    fn transition(progress: &mut Progress, id: &str, next: JobStatus) -> bool {
        if !progress.status.can_become(next) {
            warn!(job = id, from = ?progress.status, to = ?next, "Ignoring invalid status change");
            return false;
        }
        info!(job = id, from = ?progress.status, to = ?next, "Job status changed");
        progress.status = next;
        true
    }

    /// Request cancellation. A job with a registered notification keeps
    /// running unless `force` is set. Returns whether the request was taken.
    pub fn cancel(&self, force: bool) -> bool {
        if self.notification.load(Ordering::SeqCst) && !force {
            info!(job = %self.id, "Cancel ignored, completion notification registered");
            return false;
        }
        self.cancel_flag.store(true, Ordering::SeqCst);
        let mut progress = lock(&self.progress);
        // Not started yet: nothing will reach a checkpoint, so stop here.
        if progress.status == JobStatus::Analyzed {
            Self::transition(&mut progress, &self.id, JobStatus::Cancelled);
        }
        true
    }

    /// Record that a client is still interested in this job.
    pub fn heartbeat(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Snapshot for a client; also counts as a liveness signal.
    pub fn poll(&self) -> ProgressSnapshot {
        self.heartbeat();
        self.snapshot()
    }

    /// From now on the job runs to completion even without pollers.
    pub fn register_notification(&self) {
        self.notification.store(true, Ordering::SeqCst);
        debug!(job = %self.id, "Completion notification registered");
    }

    pub fn notification_registered(&self) -> bool {
        self.notification.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let progress = lock(&self.progress);
        let elapsed = match (progress.status, progress.started_at) {
            (JobStatus::Generating, Some(started)) => started.elapsed(),
            _ => progress.elapsed,
        };
        ProgressSnapshot {
            job_id: self.id.clone(),
            status: progress.status,
            current_chunk: progress.current_chunk,
            total_chunks: progress.total_chunks,
            processed_chars: progress.processed_chars,
            total_chars: progress.total_chars,
            bytes_generated: progress.bytes_generated,
            failed_chunks: progress.failed_chunks,
            message: progress.message.clone(),
            current_chapter: progress.current_chapter,
            elapsed_secs: elapsed.as_secs_f64(),
            outputs: progress.outputs.clone(),
            error: progress.error.clone(),
        }
    }

    /// The single cancellation checkpoint, evaluated once per plan entry.
    pub fn cancellation_requested(&self, liveness_timeout: Duration) -> Option<CancelReason> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            return Some(CancelReason::Requested);
        }
        if self.notification.load(Ordering::SeqCst) {
            return None;
        }
        if lock(&self.last_seen).elapsed() > liveness_timeout {
            return Some(CancelReason::Abandoned);
        }
        None
    }

    /// Enter `generating`. Fails when the job already left `analyzed`.
    pub(crate) fn begin(&self, total_chunks: usize, total_chars: usize) -> bool {
        let mut progress = lock(&self.progress);
        if !Self::transition(&mut progress, &self.id, JobStatus::Generating) {
            return false;
        }
        progress.total_chunks = total_chunks;
        progress.total_chars = total_chars;
        progress.started_at = Some(Instant::now());
        progress.message = "Starting synthesis".to_string();
        drop(progress);
        self.heartbeat();
        true
    }

    pub(crate) fn update(&self, chunk: usize, chapter: usize, message: String) {
        let mut progress = lock(&self.progress);
        progress.current_chunk = chunk;
        progress.current_chapter = Some(chapter);
        progress.message = message;
    }

    pub(crate) fn record_chunk(&self, chars: usize, bytes: u64, failed: bool) {
        let mut progress = lock(&self.progress);
        progress.processed_chars += chars;
        progress.bytes_generated += bytes;
        if failed {
            progress.failed_chunks += 1;
        }
    }

    fn stop(&self, next: JobStatus, message: String, error: Option<String>, outputs: Vec<String>) {
        let mut progress = lock(&self.progress);
        if !Self::transition(&mut progress, &self.id, next) {
            return;
        }
        if let Some(started) = progress.started_at {
            progress.elapsed = started.elapsed();
        }
        progress.message = message;
        progress.error = error;
        progress.outputs = outputs;
    }

    pub(crate) fn finish(&self, outputs: Vec<String>) {
        let failed = self.snapshot().failed_chunks;
        let message = if failed == 0 {
            "Completed".to_string()
        } else {
            format!("Completed, {} chunks skipped", failed)
        };
        self.stop(JobStatus::Done, message, None, outputs);
    }

    pub(crate) fn fail(&self, error: String) {
        self.stop(JobStatus::Error, "Failed".to_string(), Some(error), Vec::new());
    }

    pub(crate) fn mark_cancelled(&self, reason: CancelReason) {
        let message = match reason {
            CancelReason::Requested => "Cancelled",
            CancelReason::Abandoned => "Cancelled, no client activity",
        };
        self.stop(JobStatus::Cancelled, message.to_string(), None, Vec::new());
    }
}
