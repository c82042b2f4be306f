use crate::clock::timestamp_to_datetime;
use crate::db::{decode_tags, page_bounds, trim_to_option};
use crate::error::{AppError, AppResult};
use crate::reminder::models::{ListRemindersRequest, Reminder, ReminderStatus};
use crate::reminder::ReminderQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqliteConnection};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reminders (
    id TEXT PRIMARY KEY,
    realm_id TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    remind_time INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    remind_methods TEXT NOT NULL DEFAULT 'email',
    remind_targets TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(status, remind_time, id);
CREATE INDEX IF NOT EXISTS idx_reminders_realm_time ON reminders(realm_id, remind_time);

CREATE TABLE IF NOT EXISTS task_reminders (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    reminder_id TEXT NOT NULL REFERENCES reminders(id) ON DELETE CASCADE,
    created_at INTEGER NOT NULL,
    UNIQUE(task_id, reminder_id)
);

CREATE INDEX IF NOT EXISTS idx_task_reminders_reminder ON task_reminders(reminder_id);
"#;

const REMINDER_COLUMNS: &str = "id, realm_id, name, content, remind_time, status, remind_methods, \
    remind_targets, tags, created_by, created_at, updated_by, updated_at";

const MAX_LIST_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ReminderStore {
    pool: Pool<Sqlite>,
}

impl ReminderStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert_reminder(&self, reminder: &Reminder) -> AppResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::storage("acquire connection", e))?;
        insert_reminder_in_tx(&mut conn, reminder).await
    }

    pub async fn get_reminder(&self, realm_id: &str, reminder_id: &str) -> AppResult<Option<Reminder>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM reminders WHERE id = ? AND realm_id = ?",
            REMINDER_COLUMNS
        ))
        .bind(reminder_id)
        .bind(realm_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::storage("fetch reminder", e))?;

        row.as_ref().map(row_to_reminder).transpose()
    }

    pub async fn list_reminders(
        &self,
        realm_id: &str,
        request: ListRemindersRequest,
    ) -> AppResult<Vec<Reminder>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM reminders WHERE realm_id = ",
            REMINDER_COLUMNS
        ));
        qb.push_bind(realm_id.to_string());

        if let Some(status) = request.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(start) = request.start_time {
            qb.push(" AND remind_time >= ").push_bind(start.timestamp());
        }
        if let Some(end) = request.end_time {
            qb.push(" AND remind_time <= ").push_bind(end.timestamp());
        }
        if let Some(tag) = request.tag.and_then(trim_to_option) {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(reminders.tags) WHERE lower(value) = lower(")
                .push_bind(tag)
                .push("))");
        }
        if let Some(search) = request.search.and_then(trim_to_option) {
            let pattern = format!("%{}%", search.to_lowercase());
            qb.push(" AND (lower(name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(content) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(tags) LIKE ")
                .push_bind(pattern)
                .push(")");
        }

        let (limit, offset) = page_bounds(request.page, request.page_size);
        qb.push(" ORDER BY remind_time ASC, id ASC LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::storage("list reminders", e))?;

        rows.iter().map(row_to_reminder).collect()
    }

    pub async fn upcoming_reminders(
        &self,
        realm_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Reminder>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM reminders
            WHERE realm_id = ? AND status IN ('pending', 'active') AND remind_time >= ?
            ORDER BY remind_time ASC, id ASC
            LIMIT ?
            "#,
            REMINDER_COLUMNS
        ))
        .bind(realm_id)
        .bind(now.timestamp())
        .bind(limit.clamp(1, MAX_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list upcoming reminders", e))?;

        rows.iter().map(row_to_reminder).collect()
    }

    pub async fn overdue_reminders(
        &self,
        realm_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Reminder>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM reminders
            WHERE realm_id = ? AND status = 'pending' AND remind_time < ?
            ORDER BY remind_time ASC, id ASC
            LIMIT ?
            "#,
            REMINDER_COLUMNS
        ))
        .bind(realm_id)
        .bind(now.timestamp())
        .bind(limit.clamp(1, MAX_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list overdue reminders", e))?;

        rows.iter().map(row_to_reminder).collect()
    }

    /// Due reminders across every realm, oldest first, ties by id.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Reminder>> {
        self.find_due_after(now, None, limit).await
    }

    /// One page of due reminders strictly after `after` in
    /// `(remind_time, id)` order.
    pub async fn find_due_after(
        &self,
        now: DateTime<Utc>,
        after: Option<(DateTime<Utc>, &str)>,
        limit: i64,
    ) -> AppResult<Vec<Reminder>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM reminders WHERE status NOT IN ('completed', 'cancelled') AND remind_time <= ",
            REMINDER_COLUMNS
        ));
        query.push_bind(now.timestamp());
        if let Some((remind_time, id)) = after {
            query
                .push(" AND (remind_time > ")
                .push_bind(remind_time.timestamp())
                .push(" OR (remind_time = ")
                .push_bind(remind_time.timestamp())
                .push(" AND id > ")
                .push_bind(id.to_string())
                .push("))");
        }
        query
            .push(" ORDER BY remind_time ASC, id ASC LIMIT ")
            .push_bind(limit.clamp(1, MAX_LIST_LIMIT));

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::storage("find due reminders", e))?;

        rows.iter().map(row_to_reminder).collect()
    }

    /// Writes the editable fields, guarded on the status the caller read.
    pub async fn update_reminder(
        &self,
        reminder: &Reminder,
        expected_status: ReminderStatus,
    ) -> AppResult<()> {
        let tags_json = serde_json::to_string(&reminder.tags)?;

        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET name = ?, content = ?, remind_time = ?, status = ?, remind_methods = ?,
                remind_targets = ?, tags = ?, updated_by = ?, updated_at = ?
            WHERE id = ? AND realm_id = ? AND status = ?
            "#,
        )
        .bind(&reminder.name)
        .bind(&reminder.content)
        .bind(reminder.remind_time.timestamp())
        .bind(reminder.status.as_str())
        .bind(reminder.methods.join(","))
        .bind(&reminder.targets)
        .bind(tags_json)
        .bind(&reminder.updated_by)
        .bind(reminder.updated_at.timestamp())
        .bind(&reminder.id)
        .bind(&reminder.realm_id)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("update reminder '{}'", reminder.id), e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "Reminder '{}' was modified concurrently",
                reminder.id
            )));
        }
        Ok(())
    }

    /// Deletes a reminder and its task links. Returns whether a row existed.
    pub async fn delete_reminder(&self, realm_id: &str, reminder_id: &str) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start reminder delete", e))?;

        sqlx::query(
            "DELETE FROM task_reminders WHERE reminder_id IN (SELECT id FROM reminders WHERE id = ? AND realm_id = ?)",
        )
        .bind(reminder_id)
        .bind(realm_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::storage(format!("unlink reminder '{}'", reminder_id), e))?;

        let deleted = sqlx::query("DELETE FROM reminders WHERE id = ? AND realm_id = ?")
            .bind(reminder_id)
            .bind(realm_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::storage(format!("delete reminder '{}'", reminder_id), e))?;

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit reminder delete", e))?;
        Ok(deleted.rows_affected() > 0)
    }

    /// Moves a non-terminal reminder to completed. Returns false when it was
    /// already completed or cancelled.
    pub async fn mark_completed(
        &self,
        reminder_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET status = 'completed', updated_by = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'cancelled')
            "#,
        )
        .bind(actor)
        .bind(at.timestamp())
        .bind(reminder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("complete reminder '{}'", reminder_id), e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Resets a snoozable reminder to pending at a later time. Returns false
    /// when the row no longer qualifies.
    pub async fn snooze(
        &self,
        reminder_id: &str,
        remind_time: DateTime<Utc>,
        actor: &str,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET status = 'pending', remind_time = ?, updated_by = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'active', 'sent') AND remind_time < ?
            "#,
        )
        .bind(remind_time.timestamp())
        .bind(actor)
        .bind(at.timestamp())
        .bind(reminder_id)
        .bind(remind_time.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("snooze reminder '{}'", reminder_id), e))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ReminderQuery for ReminderStore {
    async fn create_linked_reminder(&self, reminder: &Reminder, task_id: &str) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start reminder transaction", e))?;

        insert_reminder_in_tx(&mut tx, reminder).await?;
        link_in_tx(&mut tx, task_id, &reminder.id, reminder.created_at).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit reminder", e))
    }

    async fn linked_reminders(&self, task_id: &str) -> AppResult<Vec<Reminder>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM reminders
            WHERE id IN (SELECT reminder_id FROM task_reminders WHERE task_id = ?)
            ORDER BY remind_time ASC, id ASC
            "#,
            REMINDER_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list task reminders", e))?;

        rows.iter().map(row_to_reminder).collect()
    }
}

async fn insert_reminder_in_tx(conn: &mut SqliteConnection, reminder: &Reminder) -> AppResult<()> {
    let tags_json = serde_json::to_string(&reminder.tags)?;

    sqlx::query(
        r#"
        INSERT INTO reminders (
            id, realm_id, name, content, remind_time, status, remind_methods, remind_targets,
            tags, created_by, created_at, updated_by, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&reminder.id)
    .bind(&reminder.realm_id)
    .bind(&reminder.name)
    .bind(&reminder.content)
    .bind(reminder.remind_time.timestamp())
    .bind(reminder.status.as_str())
    .bind(reminder.methods.join(","))
    .bind(&reminder.targets)
    .bind(tags_json)
    .bind(&reminder.created_by)
    .bind(reminder.created_at.timestamp())
    .bind(&reminder.updated_by)
    .bind(reminder.updated_at.timestamp())
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage(format!("create reminder '{}'", reminder.name), e))?;

    Ok(())
}

// A duplicate (task_id, reminder_id) pair is not an error.
async fn link_in_tx(
    conn: &mut SqliteConnection,
    task_id: &str,
    reminder_id: &str,
    at: DateTime<Utc>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO task_reminders (id, task_id, reminder_id, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(task_id, reminder_id) DO NOTHING
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(task_id)
    .bind(reminder_id)
    .bind(at.timestamp())
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage(format!("link task '{}' to reminder", task_id), e))?;

    Ok(())
}

fn row_to_reminder(row: &SqliteRow) -> AppResult<Reminder> {
    let map = |e: sqlx::Error| AppError::storage("decode reminder row", e);

    let status: String = row.try_get("status").map_err(map)?;
    let methods: String = row.try_get("remind_methods").map_err(map)?;
    let tags: String = row.try_get("tags").map_err(map)?;

    Ok(Reminder {
        id: row.try_get("id").map_err(map)?,
        realm_id: row.try_get("realm_id").map_err(map)?,
        name: row.try_get("name").map_err(map)?,
        content: row.try_get("content").map_err(map)?,
        remind_time: timestamp_to_datetime(row.try_get("remind_time").map_err(map)?),
        status: ReminderStatus::from_db(&status)?,
        methods: methods
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect(),
        targets: row.try_get("remind_targets").map_err(map)?,
        tags: decode_tags(&tags)?,
        created_by: row.try_get("created_by").map_err(map)?,
        created_at: timestamp_to_datetime(row.try_get("created_at").map_err(map)?),
        updated_by: row.try_get("updated_by").map_err(map)?,
        updated_at: timestamp_to_datetime(row.try_get("updated_at").map_err(map)?),
    })
}
