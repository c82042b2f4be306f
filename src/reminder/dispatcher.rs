use crate::channels::{
    ChannelSet, DeliveryMethod, DeliveryOutcome, RecipientDirectory, RecipientProfile,
};
use crate::clock::{to_storage_precision, Clock};
use crate::error::{AppError, AppResult};
use crate::reminder::models::{DispatchReport, Reminder, ReminderStatus};
use crate::reminder::storage::ReminderStore;
use crate::security::redact_sensitive_text;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DISPATCHER_ACTOR: &str = "reminder_dispatcher";
pub(super) const DUE_PAGE_SIZE: i64 = 200;

/// How a single reminder fared during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReminderResult {
    Completed,
    Retry,
    NoContact,
}

/// Delivers due reminders through the registered channels and owns the
/// transition to `completed`.
///
/// Ticks never overlap inside one process: a tick that finds another one in
/// flight returns immediately with [`DispatchReport::busy`] set. Delivery is
/// at-least-once since the status write happens after the channels ran.
#[derive(Clone)]
pub struct ReminderDispatcher {
    store: ReminderStore,
    directory: Arc<dyn RecipientDirectory>,
    channels: ChannelSet,
    clock: Arc<dyn Clock>,
    pub(super) in_flight: Arc<Mutex<()>>,
}

impl ReminderDispatcher {
    pub fn new(
        store: ReminderStore,
        directory: Arc<dyn RecipientDirectory>,
        channels: ChannelSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            channels,
            clock,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        to_storage_precision(self.clock.now())
    }

    /// One dispatch pass over every due reminder, oldest first, paging by
    /// `(remind_time, id)` so rows left due never hide later ones.
    /// Per-reminder problems are logged and counted; only a failed due query
    /// is returned as an error.
    pub async fn run_once(&self, cancel: &CancellationToken) -> AppResult<DispatchReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            log::debug!("Reminder dispatch already in progress, skipping tick");
            return Ok(DispatchReport {
                busy: true,
                ..Default::default()
            });
        };

        let now = self.now();
        let mut report = DispatchReport::default();
        let mut cursor: Option<(DateTime<Utc>, String)> = None;

        'pages: loop {
            let page = self
                .store
                .find_due_after(
                    now,
                    cursor.as_ref().map(|(at, id)| (*at, id.as_str())),
                    DUE_PAGE_SIZE,
                )
                .await?;
            report.due += page.len();

            for reminder in &page {
                if cancel.is_cancelled() {
                    log::warn!(
                        "Reminder dispatch cancelled after {} of {} seen",
                        report.completed,
                        report.due
                    );
                    break 'pages;
                }
                match self.process(reminder).await {
                    Ok(ReminderResult::Completed) => report.completed += 1,
                    Ok(ReminderResult::Retry) => report.retrying += 1,
                    Ok(ReminderResult::NoContact) => report.no_contact += 1,
                    Err(err) => {
                        report.failures += 1;
                        log::error!(
                            "Failed to process reminder '{}' ({}): {}",
                            reminder.id,
                            reminder.name,
                            redact_sensitive_text(&err.to_string())
                        );
                    }
                }
            }

            match page.last() {
                Some(last) if page.len() as i64 == DUE_PAGE_SIZE => {
                    cursor = Some((last.remind_time, last.id.clone()));
                }
                _ => break,
            }
        }

        if report.due == 0 {
            log::debug!("No due reminders found");
            return Ok(report);
        }

        log::info!(
            "Reminder dispatch finished: {}/{} completed, {} retrying, {} without contact, {} failed",
            report.completed,
            report.due,
            report.retrying,
            report.no_contact,
            report.failures
        );
        Ok(report)
    }

    async fn process(&self, reminder: &Reminder) -> AppResult<ReminderResult> {
        let profile = self
            .directory
            .resolve(&reminder.created_by)
            .await?
            .unwrap_or_else(|| RecipientProfile {
                user_id: reminder.created_by.clone(),
                ..Default::default()
            });

        let mut methods: Vec<DeliveryMethod> = Vec::new();
        for raw in &reminder.methods {
            match DeliveryMethod::parse(raw) {
                Some(method) if !methods.contains(&method) => methods.push(method),
                Some(_) => {}
                None => log::warn!(
                    "Reminder '{}' has unknown method '{}', skipping it",
                    reminder.id,
                    raw
                ),
            }
        }

        if !methods.is_empty() && !methods.iter().any(|m| profile.has_contact_for(*m)) {
            log::warn!(
                "User '{}' has no contact for any method of reminder '{}', leaving it {}",
                profile.user_id,
                reminder.id,
                reminder.status.as_str()
            );
            return Ok(ReminderResult::NoContact);
        }

        let mut retry = false;
        for method in methods {
            let Some(adapter) = self.channels.get(method) else {
                log::warn!(
                    "No {} adapter configured, skipping it for reminder '{}'",
                    method,
                    reminder.id
                );
                continue;
            };

            match adapter.send(reminder, &profile).await {
                DeliveryOutcome::Delivered => {
                    log::debug!("Reminder '{}' delivered via {}", reminder.id, method);
                }
                DeliveryOutcome::Skipped(reason) => {
                    log::info!("Reminder '{}' skipped {}: {}", reminder.id, method, reason);
                }
                DeliveryOutcome::Failed(err) if err.is_transient() => {
                    retry = true;
                    log::warn!(
                        "Reminder '{}' {} delivery failed, will retry: {}",
                        reminder.id,
                        method,
                        redact_sensitive_text(&err.message)
                    );
                }
                DeliveryOutcome::Failed(err) => {
                    log::error!(
                        "Reminder '{}' {} delivery failed permanently, skipping it: {}",
                        reminder.id,
                        method,
                        redact_sensitive_text(&err.message)
                    );
                }
            }
        }

        if retry {
            return Ok(ReminderResult::Retry);
        }

        if !self
            .store
            .mark_completed(&reminder.id, DISPATCHER_ACTOR, self.now())
            .await?
        {
            log::debug!("Reminder '{}' changed state during dispatch", reminder.id);
        }
        Ok(ReminderResult::Completed)
    }

    /// Marks a reminder completed on a user's request. Completing twice is
    /// a no-op; cancelled reminders cannot be completed.
    pub async fn complete(&self, realm_id: &str, reminder_id: &str, actor: &str) -> AppResult<Reminder> {
        let reminder = self.load(realm_id, reminder_id).await?;
        match reminder.status {
            ReminderStatus::Completed => return Ok(reminder),
            ReminderStatus::Cancelled => {
                return Err(AppError::validation(format!(
                    "Reminder '{}' is cancelled and cannot be completed",
                    reminder_id
                )))
            }
            _ => {}
        }

        let now = self.now();
        if !self.store.mark_completed(reminder_id, actor, now).await? {
            return Err(AppError::conflict(format!(
                "Reminder '{}' was modified concurrently",
                reminder_id
            )));
        }
        Ok(Reminder {
            status: ReminderStatus::Completed,
            updated_by: actor.to_string(),
            updated_at: now,
            ..reminder
        })
    }

    /// Moves a reminder back to pending at a later time. The new time must be
    /// in the future and after the current remind time.
    pub async fn snooze(
        &self,
        realm_id: &str,
        reminder_id: &str,
        actor: &str,
        remind_time: DateTime<Utc>,
    ) -> AppResult<Reminder> {
        let reminder = self.load(realm_id, reminder_id).await?;
        if !reminder.status.can_snooze() {
            return Err(AppError::validation(format!(
                "Cannot snooze a {} reminder",
                reminder.status.as_str()
            )));
        }

        let now = self.now();
        let remind_time = to_storage_precision(remind_time);
        if remind_time <= now {
            return Err(AppError::validation("New remind time must be in the future"));
        }
        if remind_time <= reminder.remind_time {
            return Err(AppError::validation(
                "New remind time must be later than the current one",
            ));
        }

        if !self.store.snooze(reminder_id, remind_time, actor, now).await? {
            return Err(AppError::conflict(format!(
                "Reminder '{}' was modified concurrently",
                reminder_id
            )));
        }
        log::info!("Reminder '{}' snoozed until {}", reminder_id, remind_time);

        Ok(Reminder {
            status: ReminderStatus::Pending,
            remind_time,
            updated_by: actor.to_string(),
            updated_at: now,
            ..reminder
        })
    }

    async fn load(&self, realm_id: &str, reminder_id: &str) -> AppResult<Reminder> {
        self.store
            .get_reminder(realm_id, reminder_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Reminder '{}' not found", reminder_id)))
    }
}
