//! Monitoring-task operations on a [`Session`].

use chrono::{DateTime, Utc};

use super::{timed, PersistenceError, Session};
use crate::models::task::{MonitoringTask, TaskConfig};

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: i64,
    owner_id: i64,
    name: String,
    url: String,
    filters: String,
    check_interval: i64,
    is_active: bool,
    total_checks: i64,
    last_check: Option<DateTime<Utc>>,
    next_check: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<MonitoringTask, PersistenceError> {
        Ok(MonitoringTask {
            id: self.task_id,
            owner_id: self.owner_id,
            name: self.name,
            url: self.url,
            filters: serde_json::from_str(&self.filters)?,
            check_interval_secs: self.check_interval,
            is_active: self.is_active,
            total_checks: self.total_checks,
            last_check: self.last_check,
            next_check: self.next_check,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = "task_id, owner_id, name, url, filters, check_interval, \
     is_active, total_checks, last_check, next_check, created_at, updated_at";

/// Aggregate task counters for the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCounts {
    /// All tasks.
    pub total: i64,
    /// Tasks with `is_active` set.
    pub active: i64,
}

impl Session {
    /// Inserts a new task. The first check is due immediately.
    pub async fn insert_task(
        &mut self,
        config: &TaskConfig,
    ) -> Result<MonitoringTask, PersistenceError> {
        let filters = serde_json::to_string(&config.filters)?;
        let now = Utc::now();
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "insert task",
            sqlx::query(
                "INSERT INTO monitoring_tasks \
                 (owner_id, name, url, filters, check_interval, is_active, total_checks, \
                  next_check, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 1, 0, ?, ?, ?)",
            )
            .bind(config.owner_id)
            .bind(&config.name)
            .bind(&config.url)
            .bind(&filters)
            .bind(config.check_interval_secs)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(self.executor()),
        )
        .await?;

        let task_id = result.last_insert_rowid();
        self.fetch_task(task_id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("task {task_id}")))
    }

    /// Reads a task by id.
    pub async fn fetch_task(
        &mut self,
        task_id: i64,
    ) -> Result<Option<MonitoringTask>, PersistenceError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM monitoring_tasks WHERE task_id = ?");
        let timeout = self.timeout();
        let row = timed(
            timeout,
            "fetch task",
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(task_id)
                .fetch_optional(self.executor()),
        )
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Lists tasks, optionally restricted to active ones.
    pub async fn list_tasks(
        &mut self,
        active_only: bool,
    ) -> Result<Vec<MonitoringTask>, PersistenceError> {
        let sql = if active_only {
            format!(
                "SELECT {TASK_COLUMNS} FROM monitoring_tasks WHERE is_active = 1 ORDER BY task_id"
            )
        } else {
            format!("SELECT {TASK_COLUMNS} FROM monitoring_tasks ORDER BY task_id")
        };
        let timeout = self.timeout();
        let rows = timed(
            timeout,
            "list tasks",
            sqlx::query_as::<_, TaskRow>(&sql).fetch_all(self.executor()),
        )
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Advances the schedule after publishing a check: one UPDATE writing
    /// both `next_check` and `last_check`.
    pub async fn advance_schedule(
        &mut self,
        task_id: i64,
        last_check: DateTime<Utc>,
        next_check: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let now = Utc::now();
        let timeout = self.timeout();
        timed(
            timeout,
            "advance schedule",
            sqlx::query(
                "UPDATE monitoring_tasks \
                 SET next_check = ?, last_check = ?, updated_at = ? \
                 WHERE task_id = ?",
            )
            .bind(next_check)
            .bind(last_check)
            .bind(now)
            .bind(task_id)
            .execute(self.executor()),
        )
        .await?;
        Ok(())
    }

    /// Writes a fresh `next_check` only. Used by the safe-advance path after
    /// a failed tick, on an independent session.
    pub async fn reschedule(
        &mut self,
        task_id: i64,
        next_check: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let now = Utc::now();
        let timeout = self.timeout();
        timed(
            timeout,
            "reschedule task",
            sqlx::query(
                "UPDATE monitoring_tasks SET next_check = ?, updated_at = ? WHERE task_id = ?",
            )
            .bind(next_check)
            .bind(now)
            .bind(task_id)
            .execute(self.executor()),
        )
        .await?;
        Ok(())
    }

    /// Atomically increments `total_checks`. The read-modify-write lives in
    /// SQL so concurrent ticks cannot lose updates.
    pub async fn bump_total_checks(&mut self, task_id: i64) -> Result<bool, PersistenceError> {
        let now = Utc::now();
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "bump total checks",
            sqlx::query(
                "UPDATE monitoring_tasks \
                 SET total_checks = total_checks + 1, updated_at = ? \
                 WHERE task_id = ?",
            )
            .bind(now)
            .bind(task_id)
            .execute(self.executor()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flips the task's active flag. Activation makes the first check due
    /// immediately.
    pub async fn set_task_active(
        &mut self,
        task_id: i64,
        active: bool,
    ) -> Result<bool, PersistenceError> {
        let now = Utc::now();
        let timeout = self.timeout();
        let query = if active {
            sqlx::query(
                "UPDATE monitoring_tasks \
                 SET is_active = 1, next_check = ?, updated_at = ? \
                 WHERE task_id = ?",
            )
            .bind(now)
            .bind(now)
            .bind(task_id)
        } else {
            sqlx::query(
                "UPDATE monitoring_tasks SET is_active = 0, updated_at = ? WHERE task_id = ?",
            )
            .bind(now)
            .bind(task_id)
        };
        let result = timed(timeout, "set task active", query.execute(self.executor())).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes a task; its found items are removed by the cascade.
    pub async fn delete_task(&mut self, task_id: i64) -> Result<bool, PersistenceError> {
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "delete task",
            sqlx::query("DELETE FROM monitoring_tasks WHERE task_id = ?")
                .bind(task_id)
                .execute(self.executor()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts tasks for the status snapshot.
    pub async fn task_counts(&mut self) -> Result<TaskCounts, PersistenceError> {
        #[derive(sqlx::FromRow)]
        struct CountRow {
            total: i64,
            active: i64,
        }
        let timeout = self.timeout();
        let row = timed(
            timeout,
            "count tasks",
            sqlx::query_as::<_, CountRow>(
                "SELECT COUNT(*) AS total, \
                 COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0) AS active \
                 FROM monitoring_tasks",
            )
            .fetch_one(self.executor()),
        )
        .await?;
        Ok(TaskCounts {
            total: row.total,
            active: row.active,
        })
    }
}
