//! Task executor — a bounded pool of workers draining the queue.
//!
//! Each worker claims one task at a time, hands the payload to the
//! [`TaskRunner`] collaborator, and reports the outcome back through the
//! queue's state transitions. While a task runs the worker heartbeats its
//! claim so the reaper can tell a live worker from a crashed one. On
//! shutdown, in-flight tasks get a grace period before being failed back
//! into the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use vigil_core::config::ExecutorConfig;

use crate::queue::{Task, TaskQueue};

/// Successful runner outcome.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub duration: Duration,
}

/// Runner failure kinds. Timeouts and execution failures are retried by the
/// queue's backoff policy; a payload error can never succeed and is terminal.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("execution failed: {0}")]
    Failed(String),
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// External collaborator that performs the actual work.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run a task payload. Must stop work and return
    /// [`RunnerError::Timeout`] once `timeout` elapses.
    async fn run(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<RunOutput, RunnerError>;
}

/// Worker pool. `spawn` starts the configured number of workers; they run
/// until the shutdown signal flips.
pub struct TaskExecutor {
    queue: Arc<TaskQueue>,
    runner: Arc<dyn TaskRunner>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(queue: Arc<TaskQueue>, runner: Arc<dyn TaskRunner>, config: ExecutorConfig) -> Self {
        Self {
            queue,
            runner,
            config,
        }
    }

    /// Start the worker pool.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|i| {
                let queue = self.queue.clone();
                let runner = self.runner.clone();
                let config = self.config.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("worker-{}", i + 1);
                tokio::spawn(async move {
                    tracing::info!("👷 {worker_id} started");
                    worker_loop(queue, runner, config, worker_id, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    queue: Arc<TaskQueue>,
    runner: Arc<dyn TaskRunner>,
    config: ExecutorConfig,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = Duration::from_secs(config.poll_interval_secs);
    loop {
        if *shutdown.borrow() {
            tracing::info!("👷 {worker_id} stopping");
            return;
        }
        let task = match queue.claim_next(&worker_id) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!("⚠️ {worker_id} claim failed: {e}");
                None
            }
        };
        match task {
            Some(task) => {
                execute(&queue, runner.as_ref(), &config, &worker_id, task, &mut shutdown).await;
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Run one claimed task to an outcome, heartbeating the claim throughout.
async fn execute(
    queue: &TaskQueue,
    runner: &dyn TaskRunner,
    config: &ExecutorConfig,
    worker_id: &str,
    task: Task,
    shutdown: &mut watch::Receiver<bool>,
) {
    let timeout = Duration::from_secs(config.task_timeout_secs);
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    tracing::info!("▶️ {worker_id} running task #{} ({})", task.id, task.task_type);

    let run = runner.run(&task.payload, timeout);
    tokio::pin!(run);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            result = &mut run => break Some(result),
            _ = heartbeat.tick() => {
                if let Err(e) = queue.heartbeat(task.id, worker_id) {
                    tracing::warn!("⚠️ Heartbeat for task #{} failed: {e}", task.id);
                }
            }
            // The async block keeps the non-Send watch ref out of the
            // select output, which must live across the grace await below
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                // Stop requested: let the task finish inside the grace period
                match tokio::time::timeout(grace, &mut run).await {
                    Ok(result) => break Some(result),
                    Err(_) => {
                        tracing::warn!("🛑 Task #{} aborted during shutdown", task.id);
                        if let Err(e) = queue.fail(task.id, worker_id, "aborted: shutdown grace exceeded") {
                            tracing::warn!("⚠️ Could not record abort for task #{}: {e}", task.id);
                        }
                        break None;
                    }
                }
            }
        }
    };

    let Some(result) = outcome else { return };
    let report = match result {
        Ok(output) => {
            tracing::info!(
                "✅ Task #{} finished in {:.1}s (exit {})",
                task.id,
                output.duration.as_secs_f64(),
                output.exit_status
            );
            queue.complete(task.id, worker_id, Some(&output.stdout))
        }
        Err(RunnerError::Payload(msg)) => queue.fail_permanent(task.id, worker_id, &msg),
        Err(err) => queue.fail(task.id, worker_id, &err.to_string()).map(|_| ()),
    };
    if let Err(e) = report {
        tracing::warn!("⚠️ Could not record outcome for task #{}: {e}", task.id);
    }
}

/// Runner that executes a shell command from the payload.
///
/// Payload shape: `{"command": "<shell command>"}`. The child is killed
/// when the timeout elapses.
pub struct CommandRunner;

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<RunOutput, RunnerError> {
        let command = payload
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RunnerError::Payload("missing 'command' field".to_string()))?;

        let started = std::time::Instant::now();
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| RunnerError::Timeout(timeout))?
            .map_err(|e| RunnerError::Failed(format!("spawn failed: {e}")))?;

        let duration = started.elapsed();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::Failed(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(RunOutput {
            exit_status: output.status.code().unwrap_or(0),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{RetryPolicy, TaskStatus};
    use serde_json::json;

    struct ScriptedRunner {
        outcome: fn() -> std::result::Result<RunOutput, RunnerError>,
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(
            &self,
            _payload: &serde_json::Value,
            _timeout: Duration,
        ) -> std::result::Result<RunOutput, RunnerError> {
            (self.outcome)()
        }
    }

    fn executor(outcome: fn() -> std::result::Result<RunOutput, RunnerError>) -> (Arc<TaskQueue>, TaskExecutor) {
        let queue = Arc::new(TaskQueue::open_in_memory(RetryPolicy::default()).unwrap());
        let config = ExecutorConfig {
            workers: 1,
            task_timeout_secs: 5,
            poll_interval_secs: 1,
            shutdown_grace_secs: 1,
            heartbeat_interval_secs: 1,
        };
        let exec = TaskExecutor::new(queue.clone(), Arc::new(ScriptedRunner { outcome }), config);
        (queue, exec)
    }

    async fn wait_for_status(queue: &TaskQueue, id: i64, status: TaskStatus) {
        for _ in 0..200 {
            if queue.get(id).unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task #{id} never reached {:?}", status);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_completes_task_and_records_output() {
        let (queue, exec) = executor(|| {
            Ok(RunOutput {
                exit_status: 0,
                stdout: "all good".to_string(),
                duration: Duration::from_millis(5),
            })
        });
        let id = queue.enqueue("check", &json!({}), 5).unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = exec.spawn(rx);
        wait_for_status(&queue, id, TaskStatus::Completed).await;
        let task = queue.get(id).unwrap().unwrap();
        assert_eq!(task.result.as_deref(), Some("all good"));

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runner_failure_goes_through_retry_path() {
        let (queue, exec) = executor(|| Err(RunnerError::Failed("no network".to_string())));
        let id = queue.enqueue("sync", &json!({}), 5).unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = exec.spawn(rx);
        // First attempt fails and is rescheduled with backoff
        for _ in 0..200 {
            let t = queue.get(id).unwrap().unwrap();
            if t.retry_count >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let t = queue.get(id).unwrap().unwrap();
        assert!(t.retry_count >= 1);
        assert!(t.error.as_deref().unwrap_or("").contains("no network"));

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn payload_error_is_terminal() {
        let (queue, exec) = executor(|| Err(RunnerError::Payload("no command".to_string())));
        let id = queue.enqueue("broken", &json!({}), 5).unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = exec.spawn(rx);
        wait_for_status(&queue, id, TaskStatus::Failed).await;
        let t = queue.get(id).unwrap().unwrap();
        assert_eq!(t.retry_count, 0);

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_distinct_retryable_error() {
        let (queue, exec) = executor(|| Err(RunnerError::Timeout(Duration::from_secs(5))));
        let id = queue.enqueue("slow", &json!({}), 5).unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = exec.spawn(rx);
        for _ in 0..200 {
            let t = queue.get(id).unwrap().unwrap();
            if t.retry_count >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let t = queue.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.error.as_deref().unwrap_or("").contains("timed out"));

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_exit_promptly_on_shutdown() {
        let (_queue, exec) = executor(|| {
            Ok(RunOutput {
                exit_status: 0,
                stdout: String::new(),
                duration: Duration::ZERO,
            })
        });
        let (tx, rx) = watch::channel(false);
        let handles = exec.spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
