use crate::channels::parse_methods;
use crate::clock::{to_storage_precision, Clock};
use crate::db::{normalize_tags, trim_to_option};
use crate::error::{AppError, AppResult};
use crate::reminder::models::{
    CreateReminderRequest, ListRemindersRequest, Reminder, ReminderStatus, UpdateReminderRequest,
};
use crate::reminder::storage::ReminderStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Reminder CRUD and queries. Completion and snoozing belong to the
/// dispatcher.
#[derive(Clone)]
pub struct ReminderService {
    store: ReminderStore,
    clock: Arc<dyn Clock>,
}

impl ReminderService {
    pub fn new(store: ReminderStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        to_storage_precision(self.clock.now())
    }

    pub async fn create_reminder(
        &self,
        realm_id: &str,
        actor: &str,
        request: CreateReminderRequest,
    ) -> AppResult<Reminder> {
        let now = self.now();
        request.validate(now)?;

        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            realm_id: realm_id.to_string(),
            name: request.name.trim().to_string(),
            content: request.content.trim().to_string(),
            remind_time: to_storage_precision(request.remind_time),
            status: ReminderStatus::Pending,
            methods: method_names(&request.methods)?,
            targets: request.targets.and_then(trim_to_option),
            tags: normalize_tags(&request.tags),
            created_by: actor.to_string(),
            created_at: now,
            updated_by: actor.to_string(),
            updated_at: now,
        };

        self.store.insert_reminder(&reminder).await?;
        log::info!(
            "Reminder '{}' created in realm '{}' for {}",
            reminder.id,
            realm_id,
            reminder.remind_time
        );
        Ok(reminder)
    }

    pub async fn get_reminder(&self, realm_id: &str, reminder_id: &str) -> AppResult<Reminder> {
        self.store
            .get_reminder(realm_id, reminder_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Reminder '{}' not found", reminder_id)))
    }

    pub async fn update_reminder(
        &self,
        realm_id: &str,
        reminder_id: &str,
        actor: &str,
        request: UpdateReminderRequest,
    ) -> AppResult<Reminder> {
        request.validate()?;
        let existing = self.get_reminder(realm_id, reminder_id).await?;
        if existing.status.is_terminal() {
            return Err(AppError::validation(format!(
                "Reminder '{}' is {} and can no longer be changed",
                reminder_id,
                existing.status.as_str()
            )));
        }

        let now = self.now();
        let mut updated = existing.clone();
        if let Some(name) = request.name {
            updated.name = name.trim().to_string();
        }
        if let Some(content) = request.content {
            updated.content = content.trim().to_string();
        }
        if let Some(status) = request.status {
            updated.status = status;
        }
        if let Some(remind_time) = request.remind_time {
            let remind_time = to_storage_precision(remind_time);
            if updated.status == ReminderStatus::Pending && remind_time <= now {
                return Err(AppError::validation(
                    "Reminder time must be in the future for pending reminders",
                ));
            }
            updated.remind_time = remind_time;
        }
        if let Some(methods) = request.methods {
            updated.methods = method_names(&methods)?;
        }
        if let Some(targets) = request.targets {
            updated.targets = trim_to_option(targets);
        }
        if let Some(tags) = request.tags {
            updated.tags = normalize_tags(&tags);
        }
        updated.updated_by = actor.to_string();
        updated.updated_at = now;

        self.store.update_reminder(&updated, existing.status).await?;
        Ok(updated)
    }

    /// Deleting an absent reminder succeeds.
    pub async fn delete_reminder(&self, realm_id: &str, reminder_id: &str) -> AppResult<()> {
        if self.store.delete_reminder(realm_id, reminder_id).await? {
            log::info!("Reminder '{}' deleted from realm '{}'", reminder_id, realm_id);
        }
        Ok(())
    }

    pub async fn search_reminders(
        &self,
        realm_id: &str,
        request: ListRemindersRequest,
    ) -> AppResult<Vec<Reminder>> {
        self.store.list_reminders(realm_id, request).await
    }

    pub async fn reminders_by_status(
        &self,
        realm_id: &str,
        status: ReminderStatus,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> AppResult<Vec<Reminder>> {
        self.store
            .list_reminders(
                realm_id,
                ListRemindersRequest {
                    status: Some(status),
                    page,
                    page_size,
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn upcoming_reminders(&self, realm_id: &str, limit: i64) -> AppResult<Vec<Reminder>> {
        self.store
            .upcoming_reminders(realm_id, self.now(), limit)
            .await
    }

    pub async fn overdue_reminders(&self, realm_id: &str, limit: i64) -> AppResult<Vec<Reminder>> {
        self.store
            .overdue_reminders(realm_id, self.now(), limit)
            .await
    }

    pub async fn reminders_in_range(
        &self,
        realm_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> AppResult<Vec<Reminder>> {
        if start > end {
            return Err(AppError::validation("Start time cannot be after end time"));
        }
        self.store
            .list_reminders(
                realm_id,
                ListRemindersRequest {
                    start_time: Some(start),
                    end_time: Some(end),
                    page,
                    page_size,
                    ..Default::default()
                },
            )
            .await
    }
}

fn method_names(raw: &[String]) -> AppResult<Vec<String>> {
    Ok(parse_methods(raw)?
        .into_iter()
        .map(|m| m.as_str().to_string())
        .collect())
}
