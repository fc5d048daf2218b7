//! Background task manager: bounded submission, cooperative cancellation,
//! deadline enforcement, and broadcast progress streaming.
//!
//! Tasks move `pending -> running -> {completed, failed, cancelled, timed-out}`.
//! Workers observe cancellation at checkpoints between units of work; a worker
//! that ignores the signal past the grace period is abandoned and its result
//! discarded. Every snapshot change is fanned out on a per-task broadcast
//! channel so any number of streamers can follow without blocking the worker.

use crate::telemetry::TelemetrySink;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("too many tasks: {live} live of {max} allowed")]
    TooManyTasks { live: usize, max: usize },

    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// Which operation a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    GuardRails,
    Cleanup,
    Release,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::GuardRails => "guard-rails",
            TaskKind::Cleanup => "cleanup",
            TaskKind::Release => "release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Point-in-time view of a task, also the SSE frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_s: f64,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Cooperative cancellation signal shared between the manager, the request
/// handler, and the running operation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    signal: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                signal,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _ = self.inner.signal.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve when cancellation is requested. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.signal.subscribe();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress reporter handed to operations: `(fraction in [0,1], detail)`.
pub type ProgressFn = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Borrowed progress reporter, the form operation signatures take.
pub type Progress<'a> = &'a (dyn Fn(f64, &str) + Send + Sync);

/// A progress reporter that drops everything (CLI paths that print directly).
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_fraction, _detail| {})
}

struct TaskHandle {
    snapshot: Mutex<TaskSnapshot>,
    events: broadcast::Sender<TaskSnapshot>,
    cancel: CancelToken,
}

impl TaskHandle {
    fn update(&self, mutate: impl FnOnce(&mut TaskSnapshot)) -> TaskSnapshot {
        let mut guard = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mutate(&mut guard);
        let snapshot = guard.clone();
        drop(guard);
        let _ = self.events.send(snapshot.clone());
        snapshot
    }

    fn current(&self) -> TaskSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_tasks: usize,
    pub retention: Duration,
    pub default_timeout: Duration,
    /// How long a cancelled or timed-out worker gets to wind down before it
    /// is abandoned.
    pub grace: Duration,
    /// Reaper wake interval.
    pub reap_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 100,
            retention: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(300),
            grace: Duration::from_secs(2),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Owns the bounded task map. Must be constructed inside a tokio runtime; the
/// eviction reaper is spawned on creation.
pub struct TaskManager {
    config: TaskManagerConfig,
    telemetry: Arc<TelemetrySink>,
    tasks: DashMap<String, Arc<TaskHandle>>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, telemetry: Arc<TelemetrySink>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            telemetry,
            tasks: DashMap::new(),
        });
        Self::spawn_reaper(Arc::clone(&manager));
        manager
    }

    fn live_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().current().status.is_terminal())
            .count()
    }

    /// Submit an operation for background execution. The operation receives a
    /// cancel token and a progress reporter; it returns either a JSON result
    /// or an error message for the terminal snapshot.
    pub fn submit<F, Fut>(
        self: &Arc<Self>,
        kind: TaskKind,
        timeout: Duration,
        operation: F,
    ) -> Result<String, TaskError>
    where
        F: FnOnce(CancelToken, ProgressFn) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let live = self.live_count();
        if live >= self.config.max_tasks {
            return Err(TaskError::TooManyTasks {
                live,
                max: self.config.max_tasks,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (events, _) = broadcast::channel(64);
        let handle = Arc::new(TaskHandle {
            snapshot: Mutex::new(TaskSnapshot {
                id: id.clone(),
                kind,
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                timeout_s: timeout.as_secs_f64(),
                progress: 0.0,
                detail: None,
                error: None,
                result: None,
            }),
            events,
            cancel: CancelToken::new(),
        });
        self.tasks.insert(id.clone(), Arc::clone(&handle));
        self.telemetry.increment("tasks.submitted");
        tracing::info!(target: "hephaestus::tasks", task_id = %id, kind = kind.as_str(), "task submitted");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_worker(handle, timeout, operation).await;
        });
        Ok(id)
    }

    async fn run_worker<F, Fut>(&self, handle: Arc<TaskHandle>, timeout: Duration, operation: F)
    where
        F: FnOnce(CancelToken, ProgressFn) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        // A cancel that lands while the task is still pending wins before any
        // work starts.
        if handle.cancel.is_cancelled() {
            self.finish(&handle, TaskStatus::Cancelled, None, Some("cancelled before start".into()));
            return;
        }

        handle.update(|snapshot| {
            snapshot.status = TaskStatus::Running;
            snapshot.started_at = Some(Utc::now());
        });

        let progress_handle = Arc::clone(&handle);
        let progress: ProgressFn = Arc::new(move |fraction: f64, detail: &str| {
            let fraction = fraction.clamp(0.0, 1.0);
            let detail = detail.to_string();
            progress_handle.update(|snapshot| {
                snapshot.progress = fraction;
                snapshot.detail = Some(detail.clone());
            });
        });

        let cancel = handle.cancel.clone();
        let mut work = tokio::spawn(operation(cancel.clone(), progress));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            joined = &mut work => {
                match joined {
                    Ok(Ok(result)) => self.finish(&handle, TaskStatus::Completed, Some(result), None),
                    Ok(Err(message)) => {
                        if cancel.is_cancelled() {
                            self.finish(&handle, TaskStatus::Cancelled, None, Some(message));
                        } else {
                            self.finish(&handle, TaskStatus::Failed, None, Some(message));
                        }
                    }
                    Err(join_error) => {
                        let message = if join_error.is_panic() {
                            "worker panicked".to_string()
                        } else {
                            "worker aborted".to_string()
                        };
                        self.finish(&handle, TaskStatus::Failed, None, Some(message));
                    }
                }
            }
            _ = cancel.cancelled() => {
                // Give the worker its grace period to hit a checkpoint.
                let _ = tokio::time::timeout(self.config.grace, &mut work).await;
                work.abort();
                self.finish(&handle, TaskStatus::Cancelled, None, Some("cancelled".into()));
            }
            _ = &mut deadline => {
                cancel.cancel();
                let _ = tokio::time::timeout(self.config.grace, &mut work).await;
                work.abort();
                self.finish(&handle, TaskStatus::TimedOut, None, Some(format!(
                    "task exceeded timeout of {:.0}s", timeout.as_secs_f64()
                )));
            }
        }
    }

    fn finish(
        &self,
        handle: &TaskHandle,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let snapshot = handle.update(|snapshot| {
            // First terminal transition wins; late workers must not overwrite.
            if snapshot.status.is_terminal() {
                return;
            }
            snapshot.status = status;
            snapshot.completed_at = Some(Utc::now());
            if status == TaskStatus::Completed {
                snapshot.progress = 1.0;
            }
            snapshot.result = result.clone();
            snapshot.error = error.clone();
        });
        self.telemetry.increment("tasks.terminal");
        tracing::info!(
            target: "hephaestus::tasks",
            task_id = %snapshot.id,
            status = ?snapshot.status,
            error = snapshot.error.as_deref().unwrap_or(""),
            "task reached terminal state"
        );
    }

    /// Current snapshot of one task.
    pub fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, TaskError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().current())
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))
    }

    /// Request cancellation. Terminal tasks are a no-op.
    pub fn cancel(&self, task_id: &str) -> Result<TaskSnapshot, TaskError> {
        let handle = self
            .tasks
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
        let current = handle.current();
        if !current.status.is_terminal() {
            handle.cancel.cancel();
        }
        Ok(handle.current())
    }

    /// Subscribe to a task's snapshot sequence: the current state plus a
    /// receiver for every subsequent change through the terminal one.
    pub fn subscribe(
        &self,
        task_id: &str,
    ) -> Result<(TaskSnapshot, broadcast::Receiver<TaskSnapshot>), TaskError> {
        let handle = self
            .tasks
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
        let receiver = handle.events.subscribe();
        Ok((handle.current(), receiver))
    }

    /// Remove terminal tasks older than the retention window.
    pub fn reap(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::zero());
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter_map(|entry| {
                let snapshot = entry.value().current();
                match (snapshot.status.is_terminal(), snapshot.completed_at) {
                    (true, Some(completed_at)) if completed_at < cutoff => Some(snapshot.id),
                    _ => None,
                }
            })
            .collect();
        eprintln!("reap() called, cutoff={cutoff:?}, expired={expired:?}");
        let count = expired.len();
        for id in expired {
            self.tasks.remove(&id);
        }
        count
    }

    fn spawn_reaper(manager: Arc<Self>) {
        let interval = manager.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reaped = manager.reap();
                if reaped > 0 {
                    tracing::debug!(target: "hephaestus::tasks", reaped, "evicted terminal tasks");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(max_tasks: usize) -> Arc<TaskManager> {
        TaskManager::new(
            TaskManagerConfig {
                max_tasks,
                retention: Duration::from_secs(3600),
                default_timeout: Duration::from_secs(300),
                grace: Duration::from_millis(200),
                reap_interval: Duration::from_secs(3600),
            },
            Arc::new(TelemetrySink::disabled()),
        )
    }

    async fn wait_terminal(manager: &TaskManager, id: &str) -> TaskSnapshot {
        for i in 0..200 {
            eprintln!("wait_terminal iter {i}");
            let snapshot = manager.snapshot(id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn completes_and_reports_result() {
        let manager = manager(10);
        let id = manager
            .submit(TaskKind::Cleanup, Duration::from_secs(5), |_cancel, progress| async move {
                progress(0.5, "halfway");
                Ok(json!({"removed": 3}))
            })
            .unwrap();
        let snapshot = wait_terminal(&manager, &id).await;
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.result.unwrap()["removed"], 3);
    }

    #[tokio::test]
    async fn cancellation_reaches_cooperative_worker() {
        let manager = manager(10);
        let id = manager
            .submit(TaskKind::GuardRails, Duration::from_secs(30), |cancel, _progress| async move {
                loop {
                    if cancel.is_cancelled() {
                        return Err("cancelled".to_string());
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.cancel(&id).unwrap();
        let snapshot = wait_terminal(&manager, &id).await;
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn deadline_times_out_stubborn_worker() {
        let manager = manager(10);
        let id = manager
            .submit(TaskKind::Release, Duration::from_millis(50), |_cancel, _progress| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })
            .unwrap();
        let snapshot = wait_terminal(&manager, &id).await;
        assert_eq!(snapshot.status, TaskStatus::TimedOut);
    }

    #[tokio::test]
    async fn capacity_is_enforced_on_live_tasks() {
        let manager = manager(1);
        let _id = manager
            .submit(TaskKind::Cleanup, Duration::from_secs(30), |cancel, _progress| async move {
                cancel.cancelled().await;
                Err("cancelled".to_string())
            })
            .unwrap();
        let err = manager
            .submit(TaskKind::Cleanup, Duration::from_secs(30), |_c, _p| async move {
                Ok(Value::Null)
            })
            .unwrap_err();
        assert!(matches!(err, TaskError::TooManyTasks { .. }));
    }

    #[tokio::test]
    async fn streamers_see_terminal_snapshot() {
        let manager = manager(10);
        let id = manager
            .submit(TaskKind::Cleanup, Duration::from_secs(5), |_cancel, progress| async move {
                progress(0.4, "working");
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!({"ok": true}))
            })
            .unwrap();
        let (initial, mut receiver) = manager.subscribe(&id).unwrap();
        let mut saw_terminal = initial.status.is_terminal();
        while !saw_terminal {
            match receiver.recv().await {
                Ok(snapshot) => saw_terminal = snapshot.status.is_terminal(),
                Err(_) => break,
            }
        }
        assert!(saw_terminal);
    }

    #[tokio::test]
    async fn reap_removes_old_terminal_tasks() {
        let manager = TaskManager::new(
            TaskManagerConfig {
                max_tasks: 10,
                retention: Duration::from_millis(1),
                default_timeout: Duration::from_secs(300),
                grace: Duration::from_millis(100),
                reap_interval: Duration::from_secs(3600),
            },
            Arc::new(TelemetrySink::disabled()),
        );
        let id = manager
            .submit(TaskKind::Cleanup, Duration::from_secs(5), |_c, _p| async move {
                Ok(Value::Null)
            })
            .unwrap();
        wait_terminal(&manager, &id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.reap(), 1);
        assert!(manager.snapshot(&id).is_err());
    }
}
