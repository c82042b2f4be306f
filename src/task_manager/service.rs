use crate::channels::parse_methods;
use crate::clock::{to_storage_precision, Clock};
use crate::db::{normalize_tags, trim_to_option};
use crate::error::{AppError, AppResult};
use crate::reminder::{Reminder, ReminderQuery, ReminderStatus};
use crate::task_manager::models::{
    validate_window, CreateTaskRequest, ListTasksRequest, ReminderSettings, Task, TaskStatus,
    TopUpReport, UpdateTaskRequest, DEFAULT_DIFFICULTY, DEFAULT_PRIORITY,
    DEFAULT_REMINDER_ADVANCE_MINUTES,
};
use crate::task_manager::storage::TaskStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const DEFAULT_INSTANCE_BATCH: usize = 5;
/// Top-up keeps at least this many future instances per parent.
pub const MIN_UPCOMING_INSTANCES: i64 = 3;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Owns tasks, the parent to instance relationship, and the reminders
/// derived from tasks.
#[derive(Clone)]
pub struct TaskManager {
    store: TaskStore,
    reminders: Arc<dyn ReminderQuery>,
    clock: Arc<dyn Clock>,
    instance_batch: usize,
}

impl TaskManager {
    pub fn new(store: TaskStore, reminders: Arc<dyn ReminderQuery>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            reminders,
            clock,
            instance_batch: DEFAULT_INSTANCE_BATCH,
        }
    }

    pub fn with_instance_batch(mut self, batch: usize) -> Self {
        self.instance_batch = batch.max(1);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        to_storage_precision(self.clock.now())
    }

    /// Persists a task. Repeating tasks get their first batch of instances;
    /// reminders are derived when requested. Failures after the task row is
    /// written are logged and do not fail the call.
    pub async fn create_task(
        &self,
        realm_id: &str,
        actor: &str,
        request: CreateTaskRequest,
    ) -> AppResult<Task> {
        request.validate()?;

        let now = self.now();
        let mut task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            realm_id: realm_id.to_string(),
            name: request.name.trim().to_string(),
            description: request.description.and_then(trim_to_option),
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            difficulty: request.difficulty.unwrap_or(DEFAULT_DIFFICULTY),
            status: TaskStatus::Pending,
            schedule_time: to_storage_precision(request.schedule_time),
            duration_minutes: request.duration_minutes,
            deadline: to_storage_precision(request.deadline),
            start_time: None,
            end_time: None,
            tags: normalize_tags(&request.tags),
            is_repeating: request.is_repeating,
            recurrence: request.recurrence.map(|mut rule| {
                rule.end_date = rule.end_date.map(to_storage_precision);
                rule
            }),
            instance_count: 0,
            parent_task_id: None,
            reminder: ReminderSettings {
                generate_reminders: request.generate_reminders,
                advance_minutes: request
                    .reminder_advance_minutes
                    .unwrap_or(DEFAULT_REMINDER_ADVANCE_MINUTES),
                methods: parse_methods(&request.reminder_methods)?,
                targets: request.reminder_targets.and_then(trim_to_option),
            },
            created_by: actor.to_string(),
            created_at: now,
            updated_by: actor.to_string(),
            updated_at: now,
        };

        self.store.insert_task(&task).await?;
        log::info!("Task '{}' created in realm '{}'", task.id, realm_id);

        if task.is_repeating {
            match self.materialize_instances(&task, self.instance_batch).await {
                Ok(instances) => {
                    task.instance_count += instances.len() as i64;
                    for instance in &instances {
                        self.synthesize_logged(instance).await;
                    }
                }
                Err(err) => log::error!(
                    "Failed to materialize instances of task '{}': {}",
                    task.id,
                    err
                ),
            }
        } else {
            self.synthesize_logged(&task).await;
        }

        Ok(task)
    }

    /// Materializes up to `limit` instances after the latest existing one (or
    /// from the parent's schedule time) in one transaction.
    pub async fn materialize_instances(&self, parent: &Task, limit: usize) -> AppResult<Vec<Task>> {
        self.materialize_from(parent, limit, None).await
    }

    async fn materialize_from(
        &self,
        parent: &Task,
        limit: usize,
        not_before: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<Task>> {
        if !parent.is_parent() {
            return Err(AppError::validation(format!(
                "Task '{}' is not a repeating parent task",
                parent.id
            )));
        }
        let Some(rule) = parent.recurrence.as_ref() else {
            return Err(AppError::validation(format!(
                "Task '{}' has no recurrence rule",
                parent.id
            )));
        };

        let now = self.now();
        let window = parent.window();
        let mut cursor = self.store.latest_child_schedule(&parent.id).await?;
        let mut produced = parent.instance_count;
        let mut instances = Vec::new();

        while instances.len() < limit {
            let next = match cursor {
                None => rule.first_occurrence(parent.schedule_time, produced),
                Some(at) => rule.next_occurrence(parent.schedule_time, produced, at),
            };
            let Some(at) = next else { break };
            cursor = Some(at);

            // Occurrences before the catch-up horizon are skipped and do not
            // count toward the batch.
            if let Some(horizon) = not_before.filter(|horizon| at < *horizon) {
                cursor = Some(rule.fast_forward(parent.schedule_time, at, horizon));
                continue;
            }

            instances.push(Task {
                id: uuid::Uuid::new_v4().to_string(),
                status: TaskStatus::Pending,
                schedule_time: at,
                deadline: at + window,
                start_time: None,
                end_time: None,
                is_repeating: false,
                recurrence: None,
                instance_count: 0,
                parent_task_id: Some(parent.id.clone()),
                created_at: now,
                updated_by: parent.created_by.clone(),
                updated_at: now,
                ..parent.clone()
            });
            produced += 1;
        }

        if instances.is_empty() {
            return Ok(instances);
        }

        self.store
            .insert_instances(&parent.id, parent.instance_count, &instances)
            .await?;
        log::info!(
            "Generated {} new instances for repeating task '{}'",
            instances.len(),
            parent.name
        );
        Ok(instances)
    }

    /// Derives the reminder for a task. Returns `None` when reminders are off
    /// or the remind time has already passed.
    pub async fn synthesize_reminder(&self, task: &Task) -> AppResult<Option<Reminder>> {
        if !task.reminder.generate_reminders || task.is_parent() {
            return Ok(None);
        }

        let now = self.now();
        let remind_time = task.schedule_time - Duration::minutes(task.reminder.advance_minutes);
        if remind_time <= now {
            log::warn!(
                "Reminder time {} for task '{}' has already passed, not creating a reminder",
                remind_time.format(TIME_FORMAT),
                task.id
            );
            return Ok(None);
        }

        let mut tags = vec!["task".to_string(), "auto-generated".to_string()];
        if task.is_instance() {
            tags.push("recurring".to_string());
        }
        tags.extend(task.tags.iter().cloned());

        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            realm_id: task.realm_id.clone(),
            name: format!("Task Reminder: {}", task.name),
            content: reminder_content(task),
            remind_time,
            status: ReminderStatus::Pending,
            methods: task
                .reminder
                .methods
                .iter()
                .map(|m| m.as_str().to_string())
                .collect(),
            targets: task.reminder.targets.clone(),
            tags: normalize_tags(&tags),
            created_by: task.created_by.clone(),
            created_at: now,
            updated_by: task.created_by.clone(),
            updated_at: now,
        };

        self.reminders
            .create_linked_reminder(&reminder, &task.id)
            .await?;
        log::info!("Created reminder '{}' for task '{}'", reminder.id, task.id);
        Ok(Some(reminder))
    }

    async fn synthesize_logged(&self, task: &Task) -> bool {
        match self.synthesize_reminder(task).await {
            Ok(created) => created.is_some(),
            Err(err) => {
                log::error!("Failed to generate reminder for task '{}': {}", task.id, err);
                false
            }
        }
    }

    /// Keeps every repeating parent stocked with upcoming instances. Only
    /// occurrences within a day of `now` or later are created.
    pub async fn top_up_instances(&self, now: DateTime<Utc>) -> AppResult<TopUpReport> {
        let parents = self.store.find_parent_repeating_tasks().await?;
        let mut report = TopUpReport {
            parents_checked: parents.len(),
            ..Default::default()
        };
        if parents.is_empty() {
            log::debug!("No repeating tasks found");
            return Ok(report);
        }

        let horizon = now - Duration::days(1);
        for parent in &parents {
            let upcoming = match self.store.count_upcoming_children(&parent.id, now).await {
                Ok(count) => count,
                Err(err) => {
                    report.failures += 1;
                    log::error!("Failed to count instances of task '{}': {}", parent.id, err);
                    continue;
                }
            };
            if upcoming >= MIN_UPCOMING_INSTANCES {
                continue;
            }

            match self
                .materialize_from(parent, self.instance_batch, Some(horizon))
                .await
            {
                Ok(instances) => {
                    report.instances_created += instances.len();
                    for instance in &instances {
                        if self.synthesize_logged(instance).await {
                            report.reminders_created += 1;
                        }
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    log::error!("Failed to process repeating task '{}': {}", parent.id, err);
                }
            }
        }

        log::info!(
            "Checked {} repeating tasks: {} instances and {} reminders created, {} failures",
            report.parents_checked,
            report.instances_created,
            report.reminders_created,
            report.failures
        );
        Ok(report)
    }

    /// Creates reminders for tasks scheduled within `lookahead` of `now` that
    /// should have one but do not. Returns how many were created.
    pub async fn backfill_reminders(&self, now: DateTime<Utc>, lookahead: Duration) -> AppResult<usize> {
        let tasks = self.store.tasks_missing_reminders(now, now + lookahead).await?;
        let mut created = 0;
        for task in &tasks {
            if self.synthesize_logged(task).await {
                created += 1;
            }
        }
        if created > 0 {
            log::info!("Backfilled {} task reminders", created);
        }
        Ok(created)
    }

    pub async fn get_task(&self, realm_id: &str, task_id: &str) -> AppResult<Task> {
        self.store
            .get_task(realm_id, task_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Task '{}' not found", task_id)))
    }

    pub async fn update_task(
        &self,
        realm_id: &str,
        task_id: &str,
        actor: &str,
        request: UpdateTaskRequest,
    ) -> AppResult<Task> {
        request.validate()?;
        let existing = self.get_task(realm_id, task_id).await?;
        let now = self.now();

        let mut updated = existing.clone();
        if let Some(name) = request.name {
            updated.name = name.trim().to_string();
        }
        if let Some(description) = request.description {
            updated.description = trim_to_option(description);
        }
        if let Some(priority) = request.priority {
            updated.priority = priority;
        }
        if let Some(difficulty) = request.difficulty {
            updated.difficulty = difficulty;
        }
        if let Some(schedule_time) = request.schedule_time {
            updated.schedule_time = to_storage_precision(schedule_time);
        }
        if let Some(duration) = request.duration_minutes {
            updated.duration_minutes = duration;
        }
        if let Some(deadline) = request.deadline {
            updated.deadline = to_storage_precision(deadline);
        }
        if let Some(tags) = request.tags {
            updated.tags = normalize_tags(&tags);
        }
        if let Some(generate) = request.generate_reminders {
            updated.reminder.generate_reminders = generate;
        }
        if let Some(advance) = request.reminder_advance_minutes {
            updated.reminder.advance_minutes = advance;
        }
        if let Some(methods) = request.reminder_methods {
            updated.reminder.methods = parse_methods(&methods)?;
        }
        if let Some(targets) = request.reminder_targets {
            updated.reminder.targets = trim_to_option(targets);
        }
        validate_window(updated.schedule_time, updated.deadline, updated.duration_minutes)?;
        if updated.window() != existing.window() {
            if existing.is_instance() {
                return Err(AppError::validation(format!(
                    "Instance '{}' keeps its parent's window; move schedule time and deadline together",
                    existing.id
                )));
            }
            if existing.is_parent() && existing.instance_count > 0 {
                return Err(AppError::validation(format!(
                    "Repeating task '{}' already has instances; its window cannot change",
                    existing.id
                )));
            }
        }

        if let Some(status) = request.status {
            if status != existing.status {
                apply_transition(&mut updated, status, now)?;
            }
        }
        updated.updated_by = actor.to_string();
        updated.updated_at = now;

        self.store.update_task(&updated, existing.status).await?;
        Ok(updated)
    }

    /// Deleting an absent task succeeds.
    pub async fn delete_task(&self, realm_id: &str, task_id: &str) -> AppResult<()> {
        if self.store.delete_task(realm_id, task_id).await? {
            log::info!("Task '{}' deleted from realm '{}'", task_id, realm_id);
        }
        Ok(())
    }

    pub async fn search_tasks(&self, realm_id: &str, request: ListTasksRequest) -> AppResult<Vec<Task>> {
        self.store.list_tasks(realm_id, request).await
    }

    pub async fn tasks_by_status(
        &self,
        realm_id: &str,
        status: TaskStatus,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> AppResult<Vec<Task>> {
        self.store
            .list_tasks(
                realm_id,
                ListTasksRequest {
                    status: Some(status),
                    page,
                    page_size,
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn upcoming_tasks(&self, realm_id: &str, limit: i64) -> AppResult<Vec<Task>> {
        self.store.upcoming_tasks(realm_id, self.now(), limit).await
    }

    pub async fn overdue_tasks(&self, realm_id: &str) -> AppResult<Vec<Task>> {
        self.store.overdue_tasks(realm_id, self.now()).await
    }

    pub async fn start_task(&self, realm_id: &str, task_id: &str, actor: &str) -> AppResult<Task> {
        self.transition(realm_id, task_id, actor, TaskStatus::Running).await
    }

    pub async fn complete_task(&self, realm_id: &str, task_id: &str, actor: &str) -> AppResult<Task> {
        self.transition(realm_id, task_id, actor, TaskStatus::Completed).await
    }

    pub async fn fail_task(&self, realm_id: &str, task_id: &str, actor: &str) -> AppResult<Task> {
        self.transition(realm_id, task_id, actor, TaskStatus::Failed).await
    }

    async fn transition(
        &self,
        realm_id: &str,
        task_id: &str,
        actor: &str,
        next: TaskStatus,
    ) -> AppResult<Task> {
        let existing = self.get_task(realm_id, task_id).await?;
        let now = self.now();

        let mut updated = existing.clone();
        apply_transition(&mut updated, next, now)?;
        updated.updated_by = actor.to_string();
        updated.updated_at = now;

        self.store.update_task(&updated, existing.status).await?;
        log::info!(
            "Task '{}' moved from {} to {}",
            task_id,
            existing.status.as_str(),
            next.as_str()
        );
        Ok(updated)
    }

    pub async fn task_reminders(&self, realm_id: &str, task_id: &str) -> AppResult<Vec<Reminder>> {
        let task = self.get_task(realm_id, task_id).await?;
        self.reminders.linked_reminders(&task.id).await
    }
}

/// Applies a status change and stamps start or end times.
fn apply_transition(task: &mut Task, next: TaskStatus, now: DateTime<Utc>) -> AppResult<()> {
    if !task.status.can_transition_to(next) {
        return Err(AppError::validation(format!(
            "Invalid task status transition from {} to {}",
            task.status.as_str(),
            next.as_str()
        )));
    }

    match next {
        TaskStatus::Running => {
            task.start_time = Some(now);
            task.end_time = None;
        }
        TaskStatus::Completed | TaskStatus::Failed => task.end_time = Some(now),
        TaskStatus::Pending => {
            task.start_time = None;
            task.end_time = None;
        }
    }
    task.status = next;
    Ok(())
}

fn reminder_content(task: &Task) -> String {
    let mut content = format!(
        "You have an upcoming task scheduled:\n\n\
         Task: {}\n\
         Description: {}\n\
         Scheduled: {}\n\
         Duration: {} minutes\n\
         Deadline: {}\n\
         Priority: {}/5\n\
         Difficulty: {}/5",
        task.name,
        task.description.as_deref().unwrap_or(""),
        task.schedule_time.format(TIME_FORMAT),
        task.duration_minutes,
        task.deadline.format(TIME_FORMAT),
        task.priority,
        task.difficulty,
    );
    if !task.tags.is_empty() {
        content.push_str(&format!("\nTags: {}", task.tags.join(", ")));
    }
    if task.is_instance() {
        content.push_str("\n\nThis is a recurring task instance.");
    }
    content
}
