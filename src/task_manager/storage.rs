use crate::channels::DeliveryMethod;
use crate::clock::timestamp_to_datetime;
use crate::db::{decode_tags, page_bounds, trim_to_option};
use crate::error::{AppError, AppResult};
use crate::task_manager::models::{ListTasksRequest, ReminderSettings, Task, TaskStatus};
use crate::task_manager::recurrence::{decode_days, encode_days, RecurrenceRule, RepeatPattern};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqliteConnection};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    realm_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    priority INTEGER NOT NULL DEFAULT 2,
    difficulty INTEGER NOT NULL DEFAULT 2,
    status TEXT NOT NULL,
    schedule_time INTEGER NOT NULL,
    duration_minutes INTEGER NOT NULL,
    deadline INTEGER NOT NULL,
    start_time INTEGER,
    end_time INTEGER,
    tags TEXT NOT NULL DEFAULT '[]',
    is_repeating INTEGER NOT NULL DEFAULT 0,
    repeat_pattern TEXT,
    repeat_interval INTEGER NOT NULL DEFAULT 1,
    repeat_days TEXT NOT NULL DEFAULT '',
    repeat_day_of_month INTEGER NOT NULL DEFAULT 0,
    repeat_end_date INTEGER,
    repeat_max_count INTEGER NOT NULL DEFAULT 0,
    instance_count INTEGER NOT NULL DEFAULT 0,
    parent_task_id TEXT,
    generate_reminders INTEGER NOT NULL DEFAULT 0,
    reminder_advance_minutes INTEGER NOT NULL DEFAULT 60,
    reminder_methods TEXT NOT NULL DEFAULT 'email',
    reminder_targets TEXT,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_realm_status ON tasks(realm_id, status, schedule_time);
CREATE INDEX IF NOT EXISTS idx_tasks_parent_schedule ON tasks(parent_task_id, schedule_time);
CREATE INDEX IF NOT EXISTS idx_tasks_repeating ON tasks(is_repeating, parent_task_id);
"#;

const TASK_COLUMNS: &str = "id, realm_id, name, description, priority, difficulty, status, \
    schedule_time, duration_minutes, deadline, start_time, end_time, tags, is_repeating, \
    repeat_pattern, repeat_interval, repeat_days, repeat_day_of_month, repeat_end_date, \
    repeat_max_count, instance_count, parent_task_id, generate_reminders, \
    reminder_advance_minutes, reminder_methods, reminder_targets, created_by, created_at, \
    updated_by, updated_at";

const MAX_LIST_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct TaskStore {
    pool: Pool<Sqlite>,
}

impl TaskStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert_task(&self, task: &Task) -> AppResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::storage("acquire connection", e))?;
        insert_task_in_tx(&mut conn, task).await
    }

    pub async fn get_task(&self, realm_id: &str, task_id: &str) -> AppResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE id = ? AND realm_id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .bind(realm_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::storage("fetch task", e))?;

        row.as_ref().map(row_to_task).transpose()
    }

    /// Unscoped lookup for background work that spans tenants.
    pub async fn get_task_by_id(&self, task_id: &str) -> AppResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::storage("fetch task", e))?;

        row.as_ref().map(row_to_task).transpose()
    }

    pub async fn list_tasks(&self, realm_id: &str, request: ListTasksRequest) -> AppResult<Vec<Task>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM tasks WHERE realm_id = ",
            TASK_COLUMNS
        ));
        qb.push_bind(realm_id.to_string());

        if let Some(status) = request.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(priority) = request.priority {
            qb.push(" AND priority = ").push_bind(priority);
        }
        if let Some(difficulty) = request.difficulty {
            qb.push(" AND difficulty = ").push_bind(difficulty);
        }
        if let Some(parent) = request.parent_task_id.and_then(trim_to_option) {
            qb.push(" AND parent_task_id = ").push_bind(parent);
        }
        if let Some(tag) = request.tag.and_then(trim_to_option) {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(tasks.tags) WHERE lower(value) = lower(")
                .push_bind(tag)
                .push("))");
        }
        if let Some(search) = request.search.and_then(trim_to_option) {
            let pattern = format!("%{}%", search.to_lowercase());
            qb.push(" AND (lower(name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(COALESCE(description, '')) LIKE ")
                .push_bind(pattern)
                .push(")");
        }

        let (limit, offset) = page_bounds(request.page, request.page_size);
        qb.push(" ORDER BY schedule_time ASC, id ASC LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::storage("list tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    pub async fn upcoming_tasks(
        &self,
        realm_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE realm_id = ? AND status = 'pending' AND is_repeating = 0 AND schedule_time >= ?
            ORDER BY schedule_time ASC, id ASC
            LIMIT ?
            "#,
            TASK_COLUMNS
        ))
        .bind(realm_id)
        .bind(now.timestamp())
        .bind(limit.clamp(1, MAX_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list upcoming tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    pub async fn overdue_tasks(&self, realm_id: &str, now: DateTime<Utc>) -> AppResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE realm_id = ? AND status IN ('pending', 'running') AND is_repeating = 0 AND deadline < ?
            ORDER BY deadline ASC, id ASC
            LIMIT ?
            "#,
            TASK_COLUMNS
        ))
        .bind(realm_id)
        .bind(now.timestamp())
        .bind(MAX_LIST_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list overdue tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    /// Writes the mutable fields, guarded on the status the caller read so
    /// two concurrent transitions cannot both succeed.
    pub async fn update_task(&self, task: &Task, expected_status: TaskStatus) -> AppResult<()> {
        let methods = encode_methods(&task.reminder.methods);
        let tags_json = serde_json::to_string(&task.tags)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET name = ?, description = ?, priority = ?, difficulty = ?, status = ?,
                schedule_time = ?, duration_minutes = ?, deadline = ?, start_time = ?, end_time = ?,
                tags = ?, generate_reminders = ?, reminder_advance_minutes = ?,
                reminder_methods = ?, reminder_targets = ?, updated_by = ?, updated_at = ?
            WHERE id = ? AND realm_id = ? AND status = ?
            "#,
        )
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.priority)
        .bind(task.difficulty)
        .bind(task.status.as_str())
        .bind(task.schedule_time.timestamp())
        .bind(task.duration_minutes)
        .bind(task.deadline.timestamp())
        .bind(task.start_time.map(|t| t.timestamp()))
        .bind(task.end_time.map(|t| t.timestamp()))
        .bind(tags_json)
        .bind(task.reminder.generate_reminders)
        .bind(task.reminder.advance_minutes)
        .bind(methods)
        .bind(&task.reminder.targets)
        .bind(&task.updated_by)
        .bind(task.updated_at.timestamp())
        .bind(&task.id)
        .bind(&task.realm_id)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("update task '{}'", task.id), e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "Task '{}' was modified concurrently",
                task.id
            )));
        }
        Ok(())
    }

    /// Removes a task. A parent takes its instances with it; removing an
    /// instance lowers the parent's instance_count. Returns whether a row
    /// was deleted.
    pub async fn delete_task(&self, realm_id: &str, task_id: &str) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start task delete", e))?;

        let parent: Option<Option<String>> = sqlx::query_scalar(
            "SELECT parent_task_id FROM tasks WHERE id = ? AND realm_id = ?",
        )
        .bind(task_id)
        .bind(realm_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::storage("fetch task for delete", e))?;

        let Some(parent_id) = parent else {
            return Ok(false);
        };

        sqlx::query(
            "DELETE FROM task_reminders WHERE task_id = ? OR task_id IN (SELECT id FROM tasks WHERE parent_task_id = ?)",
        )
        .bind(task_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::storage(format!("unlink reminders of '{}'", task_id), e))?;

        sqlx::query("DELETE FROM tasks WHERE parent_task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::storage(format!("delete instances of '{}'", task_id), e))?;

        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::storage(format!("delete task '{}'", task_id), e))?;

        if let Some(parent_id) = parent_id {
            sqlx::query(
                "UPDATE tasks SET instance_count = MAX(instance_count - 1, 0) WHERE id = ?",
            )
            .bind(&parent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::storage(format!("decrement instances of '{}'", parent_id), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit task delete", e))?;
        Ok(true)
    }

    pub async fn latest_child_schedule(&self, parent_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(schedule_time) FROM tasks WHERE parent_task_id = ?")
                .bind(parent_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::storage("fetch latest instance", e))?;
        Ok(latest.map(timestamp_to_datetime))
    }

    pub async fn count_upcoming_children(&self, parent_id: &str, now: DateTime<Utc>) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE parent_task_id = ? AND schedule_time >= ?",
        )
        .bind(parent_id)
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::storage("count upcoming instances", e))
    }

    /// Inserts a batch of instances and bumps the parent's counter in one
    /// transaction. Fails with a conflict when the counter moved since the
    /// caller read it.
    pub async fn insert_instances(
        &self,
        parent_id: &str,
        expected_count: i64,
        children: &[Task],
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start instance transaction", e))?;

        let bumped = sqlx::query(
            "UPDATE tasks SET instance_count = instance_count + ? WHERE id = ? AND instance_count = ?",
        )
        .bind(children.len() as i64)
        .bind(parent_id)
        .bind(expected_count)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::storage(format!("bump instance count of '{}'", parent_id), e))?;

        if bumped.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "Instances of task '{}' were materialized concurrently",
                parent_id
            )));
        }

        for child in children {
            insert_task_in_tx(&mut tx, child).await?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit instances", e))
    }

    /// Every parent repeating task, across tenants.
    pub async fn find_parent_repeating_tasks(&self) -> AppResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE is_repeating = 1 AND parent_task_id IS NULL ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list repeating tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    /// Pending, non-parent tasks with reminder generation on, scheduled in
    /// `(from, until]`, and with no linked reminder other than cancelled ones.
    pub async fn tasks_missing_reminders(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> AppResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE generate_reminders = 1
              AND is_repeating = 0
              AND status = 'pending'
              AND schedule_time > ? AND schedule_time <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM task_reminders tr
                  JOIN reminders r ON r.id = tr.reminder_id
                  WHERE tr.task_id = tasks.id AND r.status != 'cancelled'
              )
            ORDER BY schedule_time ASC, id ASC
            "#,
            TASK_COLUMNS
        ))
        .bind(from.timestamp())
        .bind(until.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list tasks missing reminders", e))?;

        rows.iter().map(row_to_task).collect()
    }
}

async fn insert_task_in_tx(conn: &mut SqliteConnection, task: &Task) -> AppResult<()> {
    let tags_json = serde_json::to_string(&task.tags)?;
    let rule = task.recurrence.as_ref();

    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, realm_id, name, description, priority, difficulty, status, schedule_time,
            duration_minutes, deadline, start_time, end_time, tags, is_repeating, repeat_pattern,
            repeat_interval, repeat_days, repeat_day_of_month, repeat_end_date, repeat_max_count,
            instance_count, parent_task_id, generate_reminders, reminder_advance_minutes,
            reminder_methods, reminder_targets, created_by, created_at, updated_by, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.realm_id)
    .bind(&task.name)
    .bind(&task.description)
    .bind(task.priority)
    .bind(task.difficulty)
    .bind(task.status.as_str())
    .bind(task.schedule_time.timestamp())
    .bind(task.duration_minutes)
    .bind(task.deadline.timestamp())
    .bind(task.start_time.map(|t| t.timestamp()))
    .bind(task.end_time.map(|t| t.timestamp()))
    .bind(tags_json)
    .bind(task.is_repeating)
    .bind(rule.map(|r| r.pattern.as_str()))
    .bind(rule.map(|r| i64::from(r.interval)).unwrap_or(1))
    .bind(rule.map(|r| encode_days(&r.days_of_week)).unwrap_or_default())
    .bind(rule.map(|r| i64::from(r.day_of_month)).unwrap_or(0))
    .bind(rule.and_then(|r| r.end_date).map(|t| t.timestamp()))
    .bind(rule.map(|r| i64::from(r.max_count)).unwrap_or(0))
    .bind(task.instance_count)
    .bind(&task.parent_task_id)
    .bind(task.reminder.generate_reminders)
    .bind(task.reminder.advance_minutes)
    .bind(encode_methods(&task.reminder.methods))
    .bind(&task.reminder.targets)
    .bind(&task.created_by)
    .bind(task.created_at.timestamp())
    .bind(&task.updated_by)
    .bind(task.updated_at.timestamp())
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage(format!("create task '{}'", task.name), e))?;

    Ok(())
}

fn encode_methods(methods: &[DeliveryMethod]) -> String {
    methods
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_methods(raw: &str) -> Vec<DeliveryMethod> {
    raw.split(',')
        .filter_map(|part| {
            let method = DeliveryMethod::parse(part);
            if method.is_none() && !part.trim().is_empty() {
                log::warn!("Ignoring unknown stored reminder method '{}'", part);
            }
            method
        })
        .collect()
}

fn row_to_task(row: &SqliteRow) -> AppResult<Task> {
    let map = |e: sqlx::Error| AppError::storage("decode task row", e);

    let is_repeating: bool = row.try_get("is_repeating").map_err(map)?;
    let parent_task_id: Option<String> = row.try_get("parent_task_id").map_err(map)?;
    let pattern: Option<String> = row.try_get("repeat_pattern").map_err(map)?;

    let recurrence = match pattern {
        Some(pattern) if is_repeating => {
            let interval: i64 = row.try_get("repeat_interval").map_err(map)?;
            let day_of_month: i64 = row.try_get("repeat_day_of_month").map_err(map)?;
            let max_count: i64 = row.try_get("repeat_max_count").map_err(map)?;
            let days: String = row.try_get("repeat_days").map_err(map)?;
            Some(RecurrenceRule {
                pattern: RepeatPattern::from_db(&pattern)?,
                interval: u32::try_from(interval).unwrap_or(1).max(1),
                days_of_week: decode_days(&days)?,
                day_of_month: u32::try_from(day_of_month).unwrap_or(0),
                end_date: row
                    .try_get::<Option<i64>, _>("repeat_end_date")
                    .map_err(map)?
                    .map(timestamp_to_datetime),
                max_count: u32::try_from(max_count).unwrap_or(0),
            })
        }
        _ => None,
    };

    let status: String = row.try_get("status").map_err(map)?;
    let tags: String = row.try_get("tags").map_err(map)?;
    let methods: String = row.try_get("reminder_methods").map_err(map)?;

    Ok(Task {
        id: row.try_get("id").map_err(map)?,
        realm_id: row.try_get("realm_id").map_err(map)?,
        name: row.try_get("name").map_err(map)?,
        description: row.try_get("description").map_err(map)?,
        priority: row.try_get("priority").map_err(map)?,
        difficulty: row.try_get("difficulty").map_err(map)?,
        status: TaskStatus::from_db(&status)?,
        schedule_time: timestamp_to_datetime(row.try_get("schedule_time").map_err(map)?),
        duration_minutes: row.try_get("duration_minutes").map_err(map)?,
        deadline: timestamp_to_datetime(row.try_get("deadline").map_err(map)?),
        start_time: row
            .try_get::<Option<i64>, _>("start_time")
            .map_err(map)?
            .map(timestamp_to_datetime),
        end_time: row
            .try_get::<Option<i64>, _>("end_time")
            .map_err(map)?
            .map(timestamp_to_datetime),
        tags: decode_tags(&tags)?,
        is_repeating,
        recurrence,
        instance_count: row.try_get("instance_count").map_err(map)?,
        parent_task_id,
        reminder: ReminderSettings {
            generate_reminders: row.try_get("generate_reminders").map_err(map)?,
            advance_minutes: row.try_get("reminder_advance_minutes").map_err(map)?,
            methods: decode_methods(&methods),
            targets: row.try_get("reminder_targets").map_err(map)?,
        },
        created_by: row.try_get("created_by").map_err(map)?,
        created_at: timestamp_to_datetime(row.try_get("created_at").map_err(map)?),
        updated_by: row.try_get("updated_by").map_err(map)?,
        updated_at: timestamp_to_datetime(row.try_get("updated_at").map_err(map)?),
    })
}

#[cfg(test)]
mod tests;
