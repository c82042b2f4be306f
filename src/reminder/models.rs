use crate::channels::parse_methods;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    #[default]
    Pending,
    Active,
    Sent,
    Completed,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "sent" => Ok(Self::Sent),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(AppError::validation(format!("Invalid reminder status: {}", value))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_snooze(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Sent)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub realm_id: String,
    pub name: String,
    pub content: String,
    pub remind_time: DateTime<Utc>,
    pub status: ReminderStatus,
    /// Stored as given so a method no adapter knows is still visible to
    /// the dispatcher (and skipped there).
    pub methods: Vec<String>,
    pub targets: Option<String>,
    pub tags: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateReminderRequest {
    pub name: String,
    pub content: String,
    pub remind_time: DateTime<Utc>,
    #[serde(default)]
    pub methods: Vec<String>,
    pub targets: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CreateReminderRequest {
    pub fn validate(&self, now: DateTime<Utc>) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("Reminder name cannot be empty"));
        }
        if self.content.trim().is_empty() {
            return Err(AppError::validation("Reminder content cannot be empty"));
        }
        if self.remind_time <= now {
            return Err(AppError::validation("Reminder time must be in the future"));
        }
        parse_methods(&self.methods)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReminderRequest {
    pub name: Option<String>,
    pub content: Option<String>,
    pub status: Option<ReminderStatus>,
    pub remind_time: Option<DateTime<Utc>>,
    pub methods: Option<Vec<String>>,
    pub targets: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl UpdateReminderRequest {
    pub fn validate(&self) -> AppResult<()> {
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(AppError::validation("Reminder name cannot be empty"));
        }
        if matches!(&self.content, Some(content) if content.trim().is_empty()) {
            return Err(AppError::validation("Reminder content cannot be empty"));
        }
        match self.status {
            Some(ReminderStatus::Completed) => {
                return Err(AppError::validation(
                    "Reminders are completed through the complete operation",
                ))
            }
            Some(ReminderStatus::Sent) => {
                return Err(AppError::validation(
                    "Status must be one of: pending, active, cancelled",
                ))
            }
            _ => {}
        }
        if let Some(methods) = &self.methods {
            parse_methods(methods)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListRemindersRequest {
    pub search: Option<String>,
    pub status: Option<ReminderStatus>,
    pub tag: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeRequest {
    pub remind_time: DateTime<Utc>,
}

/// Summary of one dispatcher tick.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Another tick was still running; nothing was done.
    pub busy: bool,
    pub due: usize,
    pub completed: usize,
    pub retrying: usize,
    pub no_contact: usize,
    pub failures: usize,
}
