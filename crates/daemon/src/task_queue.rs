//! Per-folder task queue (spec §4.E).
//!
//! New relative to `codescope` (which processes every file in one `rayon`
//! `par_iter` pass with no persistent queue or backoff). Grounded on the
//! debounce bookkeeping style in `codescope::watch.rs` (a plain
//! `HashMap<K, Instant>` used to track deadlines) applied here to retry
//! scheduling instead of filesystem-event coalescing.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use folderd_core::types::{Task, TaskCounters, TaskStatus};

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Base delay for exponential backoff: `base · 2^retryCount` (§4.E, §4.D).
const RETRY_BASE_MS: i64 = 1000;

/// Bounded-concurrency, retry-aware queue owned by exactly one orchestrator.
/// Callers outside the orchestrator observe state only through [`Self::stats`]
/// snapshots, never by touching the queue directly (§5 shared-resource
/// policy).
pub struct TaskQueue {
    max_concurrent: usize,
    in_progress: usize,
    fresh: VecDeque<Task>,
    waiting_retry: Vec<Task>,
    completed: Vec<Task>,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            in_progress: 0,
            fresh: VecDeque::new(),
            waiting_retry: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn add_task(&mut self, task: Task) {
        self.fresh.push_back(task);
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) {
        for t in tasks {
            self.add_task(t);
        }
    }

    /// Dispatch the next eligible task. Retry-scheduled tasks whose deadline
    /// has elapsed take priority over fresh pending tasks; among fresh
    /// tasks, FIFO by insertion order (§4.E `NextTask`).
    pub fn next_task(&mut self) -> Option<Task> {
        if self.in_progress >= self.max_concurrent {
            return None;
        }

        let now = now_unix_ms();
        if let Some(pos) = self
            .waiting_retry
            .iter()
            .position(|t| t.scheduled_at_unix_ms <= now)
        {
            let mut task = self.waiting_retry.remove(pos);
            task.status = TaskStatus::InProgress;
            task.started_at_unix_ms = Some(now);
            self.in_progress += 1;
            return Some(task);
        }

        if let Some(mut task) = self.fresh.pop_front() {
            task.status = TaskStatus::InProgress;
            task.started_at_unix_ms = Some(now);
            self.in_progress += 1;
            return Some(task);
        }

        None
    }

    /// Record the outcome of a dispatched task. On error with retries
    /// remaining, the task is rescheduled at `now + base · 2^retryCount` and
    /// returns to `pending` eligibility at that time; on the
    /// `maxRetries`-th failure it transitions to terminal `failed`.
    pub fn update_status(&mut self, mut task: Task, status: TaskStatus, error_message: Option<String>) {
        self.in_progress = self.in_progress.saturating_sub(1);
        let now = now_unix_ms();

        match status {
            TaskStatus::Success => {
                task.status = TaskStatus::Success;
                task.completed_at_unix_ms = Some(now);
                self.completed.push(task);
            }
            TaskStatus::Error => {
                task.error_message = error_message;
                if task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    task.status = TaskStatus::Error;
                    let backoff = RETRY_BASE_MS * 2i64.pow(task.retry_count.saturating_sub(1));
                    task.scheduled_at_unix_ms = now + backoff;
                    self.waiting_retry.push(task);
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at_unix_ms = Some(now);
                    self.completed.push(task);
                }
            }
            other => {
                task.status = other;
                self.completed.push(task);
            }
        }
    }

    pub fn stats(&self) -> TaskCounters {
        let succeeded = self.completed.iter().filter(|t| t.status == TaskStatus::Success).count() as u32;
        let failed = self.completed.iter().filter(|t| t.status == TaskStatus::Failed).count() as u32;
        TaskCounters {
            pending: self.fresh.len() as u32,
            in_progress: self.in_progress as u32,
            succeeded,
            failed,
            retrying: self.waiting_retry.len() as u32,
        }
    }

    /// True once there is no pending, in-progress, or retrying work (§4.F
    /// "indexing -> active" trigger: "task queue drained").
    pub fn is_drained(&self) -> bool {
        self.fresh.is_empty() && self.waiting_retry.is_empty() && self.in_progress == 0
    }

    pub fn clear_completed(&mut self) {
        self.completed.clear();
    }

    pub fn clear_all(&mut self) {
        self.fresh.clear();
        self.waiting_retry.clear();
        self.completed.clear();
        self.in_progress = 0;
    }

    pub fn retry_delay(retry_count: u32) -> Duration {
        Duration::from_millis(RETRY_BASE_MS as u64 * 2u64.pow(retry_count))
    }
}
