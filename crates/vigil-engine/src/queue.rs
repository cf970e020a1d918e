//! Durable priority task queue backed by SQLite.
//!
//! Every state transition is committed before it is acted on, so a crash at
//! any point leaves the queue recoverable: tasks found `running` at startup
//! are requeued, and a periodic reaper does the same for claims whose worker
//! stopped heartbeating. Claims use a compare-and-swap update so two workers
//! can never run the same task.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use vigil_core::{Result, VigilError};

/// Lifecycle of a queued task.
///
/// ```text
/// pending ──claim──▶ running ──▶ completed
///    ▲                  │
///    └──retry (backoff)─┤
///                       └──▶ dead_letter (retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Terminal, non-retryable failure (e.g. malformed payload).
    Failed,
    DeadLetter,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(VigilError::Store(format!("unknown task status: {other}"))),
        }
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Lower value = more urgent.
    pub priority: i64,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Retry schedule: exponential backoff with jitter, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `retry_count` (1-based), with up to 20% jitter.
    pub fn delay_secs(&self, retry_count: u32) -> u64 {
        let exp = retry_count.saturating_sub(1).min(16);
        let base = self
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_secs);
        let jitter = rand::thread_rng().gen_range(0..=base / 5);
        (base + jitter).min(self.backoff_cap_secs)
    }
}

/// SQLite-backed task queue. `Send + Sync`; the connection sits behind a
/// mutex and every public operation is a single transaction-free statement
/// or a short CAS loop.
pub struct TaskQueue {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl TaskQueue {
    /// Open (or create) the queue database. Performs no recovery, so it is
    /// safe to use from the operator CLI while a daemon holds live claims.
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let queue = Self {
            conn: Mutex::new(conn),
            retry,
        };
        queue.migrate()?;
        Ok(queue)
    }

    /// Daemon startup: open the queue and requeue tasks left `running` by a
    /// prior crash. Only the process that owns the workers may call this —
    /// a `running` row without a live claim holder is an orphan, but while
    /// a daemon runs its claims are alive and must not be reset.
    pub fn open_for_daemon(path: &Path, retry: RetryPolicy) -> Result<Self> {
        let queue = Self::open(path, retry)?;
        let recovered = queue.recover_orphans()?;
        if recovered > 0 {
            tracing::info!("🔁 Requeued {recovered} task(s) interrupted by restart");
        }
        Ok(queue)
    }

    /// In-memory queue for tests.
    pub fn open_in_memory(retry: RetryPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let queue = Self {
            conn: Mutex::new(conn),
            retry,
        };
        queue.migrate()?;
        Ok(queue)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type       TEXT NOT NULL,
                payload         TEXT NOT NULL,
                priority        INTEGER NOT NULL DEFAULT 5,
                status          TEXT NOT NULL DEFAULT 'pending',
                retry_count     INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                started_at      INTEGER,
                completed_at    INTEGER,
                claimed_by      TEXT,
                heartbeat_at    INTEGER,
                next_attempt_at INTEGER,
                result          TEXT,
                error           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_claim
                ON tasks (status, priority, created_at);
            ",
        )?;
        Ok(())
    }

    /// Add a task; returns its id. Lower priority value runs first.
    pub fn enqueue(&self, task_type: &str, payload: &serde_json::Value, priority: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO tasks (task_type, payload, priority, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![task_type, payload.to_string(), priority, Utc::now().timestamp()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!("📥 Enqueued task #{id} ({task_type}, priority {priority})");
        Ok(id)
    }

    /// Claim the most urgent eligible pending task for `worker_id`.
    ///
    /// Eligible means status is `pending` and any retry backoff has elapsed.
    /// Selection and claim are separate statements; the claim only succeeds
    /// if the row is still pending, so a lost race just retries.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let now = Utc::now().timestamp();
        loop {
            let candidate: Option<i64> = conn
                .query_row(
                    "SELECT id FROM tasks
                     WHERE status = 'pending'
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                     ORDER BY priority ASC, created_at ASC, id ASC
                     LIMIT 1",
                    params![now],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            let updated = conn.execute(
                "UPDATE tasks
                 SET status = 'running', claimed_by = ?1, started_at = ?2, heartbeat_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![worker_id, now, id],
            )?;
            if updated == 1 {
                let task = Self::fetch(&conn, id)?
                    .ok_or_else(|| VigilError::NotFound(format!("task {id}")))?;
                tracing::debug!("🔒 Worker {worker_id} claimed task #{id}");
                return Ok(Some(task));
            }
            // Lost the race; pick the next candidate.
        }
    }

    /// Mark a running task successful. The claim token (`worker_id`) must
    /// still match; a worker whose claim was revoked by the reaper gets a
    /// logged no-op instead of overwriting the new holder's run.
    pub fn complete(&self, id: i64, worker_id: &str, result: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let updated = conn.execute(
            "UPDATE tasks
             SET status = 'completed', completed_at = ?1, result = ?2,
                 claimed_by = NULL, heartbeat_at = NULL
             WHERE id = ?3 AND status = 'running' AND claimed_by = ?4",
            params![Utc::now().timestamp(), result, id, worker_id],
        )?;
        if updated == 0 {
            return Self::report_from_revoked_claim(&conn, id, worker_id);
        }
        tracing::info!("✅ Task #{id} completed");
        Ok(())
    }

    /// Mark a running task failed. Schedules a backoff retry, or moves the
    /// task to the dead-letter state once retries are exhausted. Same claim
    /// token rule as [`complete`](Self::complete).
    pub fn fail(&self, id: i64, worker_id: &str, error: &str) -> Result<TaskStatus> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let retry_count: Option<u32> = conn
            .query_row(
                "SELECT retry_count FROM tasks
                 WHERE id = ?1 AND status = 'running' AND claimed_by = ?2",
                params![id, worker_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(retry_count) = retry_count else {
            Self::report_from_revoked_claim(&conn, id, worker_id)?;
            return Ok(TaskStatus::Running);
        };

        let attempt = retry_count + 1;
        if attempt > self.retry.max_retries {
            conn.execute(
                "UPDATE tasks
                 SET status = 'dead_letter', completed_at = ?1, error = ?2,
                     retry_count = ?3, claimed_by = NULL, heartbeat_at = NULL
                 WHERE id = ?4 AND claimed_by = ?5",
                params![Utc::now().timestamp(), error, attempt, id, worker_id],
            )?;
            tracing::warn!("💀 Task #{id} dead-lettered after {attempt} attempts: {error}");
            return Ok(TaskStatus::DeadLetter);
        }

        let delay = self.retry.delay_secs(attempt);
        conn.execute(
            "UPDATE tasks
             SET status = 'pending', error = ?1, retry_count = ?2,
                 next_attempt_at = ?3, claimed_by = NULL, heartbeat_at = NULL,
                 started_at = NULL
             WHERE id = ?4 AND claimed_by = ?5",
            params![error, attempt, Utc::now().timestamp() + delay as i64, id, worker_id],
        )?;
        tracing::warn!("🔁 Task #{id} failed (attempt {attempt}), retrying in {delay}s: {error}");
        Ok(TaskStatus::Pending)
    }

    /// Mark a running task failed without scheduling a retry. Used when the
    /// failure cannot possibly succeed on a rerun.
    pub fn fail_permanent(&self, id: i64, worker_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let updated = conn.execute(
            "UPDATE tasks
             SET status = 'failed', completed_at = ?1, error = ?2,
                 claimed_by = NULL, heartbeat_at = NULL
             WHERE id = ?3 AND status = 'running' AND claimed_by = ?4",
            params![Utc::now().timestamp(), error, id, worker_id],
        )?;
        if updated == 0 {
            return Self::report_from_revoked_claim(&conn, id, worker_id);
        }
        tracing::error!("❌ Task #{id} failed permanently: {error}");
        Ok(())
    }

    /// A finishing update matched no row. If the task is running under a
    /// different claim, the caller's claim was revoked and its report is
    /// dropped; otherwise the call was plainly invalid.
    fn report_from_revoked_claim(conn: &Connection, id: i64, worker_id: &str) -> Result<()> {
        let holder: Option<Option<String>> = conn
            .query_row(
                "SELECT claimed_by FROM tasks WHERE id = ?1 AND status = 'running'",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match holder {
            Some(holder) => {
                tracing::warn!(
                    "⚠️ Dropping report for task #{id} from {worker_id}: claim now held by {}",
                    holder.as_deref().unwrap_or("nobody")
                );
                Ok(())
            }
            None => Err(VigilError::InvalidState(format!("task {id} is not running"))),
        }
    }

    /// Refresh a running claim's heartbeat.
    pub fn heartbeat(&self, id: i64, worker_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "UPDATE tasks SET heartbeat_at = ?1
             WHERE id = ?2 AND status = 'running' AND claimed_by = ?3",
            params![Utc::now().timestamp(), id, worker_id],
        )?;
        Ok(())
    }

    /// Requeue running tasks whose heartbeat is older than `stale_secs`.
    /// Returns how many claims were reaped.
    pub fn requeue_stale(&self, stale_secs: u64) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = Utc::now().timestamp() - stale_secs as i64;
        let reaped = conn.execute(
            "UPDATE tasks
             SET status = 'pending', claimed_by = NULL, heartbeat_at = NULL,
                 started_at = NULL
             WHERE status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
            params![cutoff],
        )?;
        if reaped > 0 {
            tracing::warn!("⏰ Reaped {reaped} stale claim(s)");
        }
        Ok(reaped)
    }

    /// Cancel a pending task. Running or finished tasks cannot be cancelled.
    pub fn cancel(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let updated = conn.execute(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![Utc::now().timestamp(), id],
        )?;
        if updated == 0 {
            return Err(VigilError::InvalidState(format!(
                "task {id} is not pending and cannot be cancelled"
            )));
        }
        tracing::info!("🚫 Task #{id} cancelled");
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Self::fetch(&conn, id)
    }

    /// Pending tasks in claim order.
    pub fn pending(&self, limit: usize) -> Result<Vec<Task>> {
        self.list(Some(TaskStatus::Pending), limit)
    }

    /// List tasks, optionally filtered by status, in claim order.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tasks = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE status = ?1
                     ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?2",
                )?;
                stmt.query_map(params![status.as_str(), limit as i64], Self::row_to_task)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks
                     ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?1",
                )?;
                stmt.query_map(params![limit as i64], Self::row_to_task)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(tasks)
    }

    /// Task counts grouped by status string.
    pub fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Delete terminal tasks older than `max_age_days`. Returns rows removed.
    pub fn cleanup_old(&self, max_age_days: u32) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = Utc::now().timestamp() - (max_age_days as i64) * 86_400;
        let removed = conn.execute(
            "DELETE FROM tasks
             WHERE status IN ('completed', 'failed', 'dead_letter', 'cancelled')
               AND completed_at IS NOT NULL AND completed_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!("🧹 Cleaned up {removed} old task(s)");
        }
        Ok(removed)
    }

    /// Startup recovery: requeue everything still marked running.
    fn recover_orphans(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let recovered = conn.execute(
            "UPDATE tasks
             SET status = 'pending', claimed_by = NULL, heartbeat_at = NULL,
                 started_at = NULL
             WHERE status = 'running'",
            [],
        )?;
        Ok(recovered)
    }

    fn fetch(conn: &Connection, id: i64) -> Result<Option<Task>> {
        let task = conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], Self::row_to_task)
            .optional()?;
        Ok(task)
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
        let payload_raw: String = row.get("payload")?;
        let status_raw: String = row.get("status")?;
        Ok(Task {
            id: row.get("id")?,
            task_type: row.get("task_type")?,
            payload: serde_json::from_str(&payload_raw)
                .unwrap_or(serde_json::Value::String(payload_raw)),
            priority: row.get("priority")?,
            status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Pending),
            retry_count: row.get("retry_count")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            claimed_by: row.get("claimed_by")?,
            heartbeat_at: row.get("heartbeat_at")?,
            next_attempt_at: row.get("next_attempt_at")?,
            result: row.get("result")?,
            error: row.get("error")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> TaskQueue {
        TaskQueue::open_in_memory(RetryPolicy::default()).unwrap()
    }

    #[test]
    fn claims_by_priority_then_fifo() {
        let q = queue();
        let low = q.enqueue("report", &json!({}), 9).unwrap();
        let urgent = q.enqueue("alert", &json!({}), 1).unwrap();
        let urgent2 = q.enqueue("alert", &json!({}), 1).unwrap();

        assert_eq!(q.claim_next("w1").unwrap().unwrap().id, urgent);
        assert_eq!(q.claim_next("w1").unwrap().unwrap().id, urgent2);
        assert_eq!(q.claim_next("w1").unwrap().unwrap().id, low);
        assert!(q.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn claimed_task_is_invisible_to_other_workers() {
        let q = queue();
        q.enqueue("job", &json!({"n": 1}), 5).unwrap();
        let t = q.claim_next("w1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.claimed_by.as_deref(), Some("w1"));
        assert!(q.claim_next("w2").unwrap().is_none());
    }

    #[test]
    fn complete_records_result() {
        let q = queue();
        let id = q.enqueue("job", &json!({}), 5).unwrap();
        q.claim_next("w1").unwrap().unwrap();
        q.complete(id, "w1", Some("done")).unwrap();

        let t = q.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_deref(), Some("done"));
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn complete_requires_running_state() {
        let q = queue();
        let id = q.enqueue("job", &json!({}), 5).unwrap();
        assert!(matches!(
            q.complete(id, "w1", None),
            Err(VigilError::InvalidState(_))
        ));
    }

    #[test]
    fn fail_schedules_backoff_then_dead_letters() {
        let q = TaskQueue::open_in_memory(RetryPolicy {
            max_retries: 2,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
        })
        .unwrap();
        let id = q.enqueue("flaky", &json!({}), 5).unwrap();

        // Attempt 1: retried with a future next_attempt_at
        q.claim_next("w1").unwrap().unwrap();
        assert_eq!(q.fail(id, "w1", "boom").unwrap(), TaskStatus::Pending);
        let t = q.get(id).unwrap().unwrap();
        assert_eq!(t.retry_count, 1);
        assert!(t.next_attempt_at.unwrap() > Utc::now().timestamp());
        // Backoff makes it invisible right now
        assert!(q.claim_next("w1").unwrap().is_none());

        // Force eligibility and burn the remaining attempts
        {
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE tasks SET next_attempt_at = 0", []).unwrap();
        }
        q.claim_next("w1").unwrap().unwrap();
        assert_eq!(q.fail(id, "w1", "boom").unwrap(), TaskStatus::Pending);
        {
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE tasks SET next_attempt_at = 0", []).unwrap();
        }
        q.claim_next("w1").unwrap().unwrap();
        assert_eq!(q.fail(id, "w1", "boom").unwrap(), TaskStatus::DeadLetter);

        let t = q.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::DeadLetter);
        assert_eq!(t.error.as_deref(), Some("boom"));
    }

    #[test]
    fn reaper_requeues_stale_claims_only() {
        let q = queue();
        let id = q.enqueue("job", &json!({}), 5).unwrap();
        q.claim_next("w1").unwrap().unwrap();

        // Fresh heartbeat: untouched
        assert_eq!(q.requeue_stale(120).unwrap(), 0);

        // Age the heartbeat past the threshold
        {
            let conn = q.conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET heartbeat_at = heartbeat_at - 500",
                [],
            )
            .unwrap();
        }
        assert_eq!(q.requeue_stale(120).unwrap(), 1);
        let t = q.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.claimed_by.is_none());
    }

    #[test]
    fn cancel_only_touches_pending_tasks() {
        let q = queue();
        let id = q.enqueue("job", &json!({}), 5).unwrap();
        q.cancel(id).unwrap();
        assert_eq!(q.get(id).unwrap().unwrap().status, TaskStatus::Cancelled);

        let id2 = q.enqueue("job", &json!({}), 5).unwrap();
        q.claim_next("w1").unwrap().unwrap();
        assert!(matches!(q.cancel(id2), Err(VigilError::InvalidState(_))));
    }

    #[test]
    fn restart_recovers_running_tasks() {
        let path = std::env::temp_dir()
            .join(format!("vigil-queue-{}.db", uuid::Uuid::new_v4()));
        {
            let q = TaskQueue::open_for_daemon(&path, RetryPolicy::default()).unwrap();
            q.enqueue("job", &json!({}), 5).unwrap();
            q.claim_next("w1").unwrap().unwrap();
            // Simulated crash: task left running
        }
        let q = TaskQueue::open_for_daemon(&path, RetryPolicy::default()).unwrap();
        let t = q.claim_next("w2").unwrap().unwrap();
        assert_eq!(t.claimed_by.as_deref(), Some("w2"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn plain_open_leaves_live_claims_alone() {
        let path = std::env::temp_dir()
            .join(format!("vigil-queue-{}.db", uuid::Uuid::new_v4()));
        let daemon = TaskQueue::open_for_daemon(&path, RetryPolicy::default()).unwrap();
        let id = daemon.enqueue("job", &json!({}), 5).unwrap();
        daemon.claim_next("w1").unwrap().unwrap();
        daemon.heartbeat(id, "w1").unwrap();

        // An inspection-style open on the same store must not reset the
        // daemon's live claim
        let inspector = TaskQueue::open(&path, RetryPolicy::default()).unwrap();
        let t = inspector.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.claimed_by.as_deref(), Some("w1"));
        assert!(inspector.claim_next("other").unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn stale_worker_report_is_dropped_after_reclaim() {
        let q = queue();
        let id = q.enqueue("job", &json!({}), 5).unwrap();
        q.claim_next("w1").unwrap().unwrap();

        // w1 stops heartbeating; the reaper revokes its claim, w2 takes over
        {
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE tasks SET heartbeat_at = heartbeat_at - 500", [])
                .unwrap();
        }
        assert_eq!(q.requeue_stale(120).unwrap(), 1);
        q.claim_next("w2").unwrap().unwrap();

        // w1 comes back with a result: dropped, not an error
        q.complete(id, "w1", Some("late")).unwrap();
        let t = q.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.claimed_by.as_deref(), Some("w2"));
        assert!(t.result.is_none());

        // Same for a late failure report
        assert_eq!(q.fail(id, "w1", "boom").unwrap(), TaskStatus::Running);
        assert_eq!(q.get(id).unwrap().unwrap().retry_count, 0);

        // The live holder's report still lands
        q.complete(id, "w2", Some("done")).unwrap();
        assert_eq!(q.get(id).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn counts_and_cleanup() {
        let q = queue();
        let done = q.enqueue("a", &json!({}), 5).unwrap();
        q.enqueue("b", &json!({}), 5).unwrap();
        q.claim_next("w1").unwrap().unwrap();
        q.complete(done, "w1", None).unwrap();

        let counts = q.counts_by_status().unwrap();
        assert!(counts.contains(&("completed".to_string(), 1)));
        assert!(counts.contains(&("pending".to_string(), 1)));

        // Terminal and old enough: removed
        {
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE tasks SET completed_at = 0 WHERE status = 'completed'", [])
                .unwrap();
        }
        assert_eq!(q.cleanup_old(7).unwrap(), 1);
    }

    #[test]
    fn fail_permanent_skips_retries() {
        let q = queue();
        let id = q.enqueue("bad", &json!({}), 5).unwrap();
        q.claim_next("w1").unwrap().unwrap();
        q.fail_permanent(id, "w1", "payload is not valid").unwrap();

        let t = q.get(id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 0);
        assert!(q.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn list_filters_by_status() {
        let q = queue();
        q.enqueue("a", &json!({}), 5).unwrap();
        let done = q.enqueue("b", &json!({}), 1).unwrap();
        q.claim_next("w1").unwrap();
        q.complete(done, "w1", None).unwrap();

        assert_eq!(q.list(Some(TaskStatus::Pending), 10).unwrap().len(), 1);
        assert_eq!(q.list(Some(TaskStatus::Completed), 10).unwrap().len(), 1);
        assert_eq!(q.list(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_secs: 30,
            backoff_cap_secs: 600,
        };
        assert!(policy.delay_secs(1) >= 30);
        assert!(policy.delay_secs(2) >= 60);
        assert!(policy.delay_secs(10) <= 600);
    }
}
