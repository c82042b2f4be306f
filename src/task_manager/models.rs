use crate::channels::{parse_methods, DeliveryMethod};
use crate::error::{AppError, AppResult};
use crate::task_manager::recurrence::RecurrenceRule;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRIORITY: i32 = 2;
pub const DEFAULT_DIFFICULTY: i32 = 2;
pub const DEFAULT_REMINDER_ADVANCE_MINUTES: i64 = 60;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(AppError::validation(format!("Invalid task status: {}", value))),
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSettings {
    pub generate_reminders: bool,
    pub advance_minutes: i64,
    pub methods: Vec<DeliveryMethod>,
    pub targets: Option<String>,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            generate_reminders: false,
            advance_minutes: DEFAULT_REMINDER_ADVANCE_MINUTES,
            methods: vec![DeliveryMethod::Email],
            targets: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub realm_id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub difficulty: i32,
    pub status: TaskStatus,
    pub schedule_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub deadline: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub is_repeating: bool,
    pub recurrence: Option<RecurrenceRule>,
    pub instance_count: i64,
    pub parent_task_id: Option<String>,
    pub reminder: ReminderSettings,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Span between schedule time and deadline; every instance inherits it.
    pub fn window(&self) -> Duration {
        self.deadline - self.schedule_time
    }

    pub fn is_parent(&self) -> bool {
        self.is_repeating && self.parent_task_id.is_none()
    }

    pub fn is_instance(&self) -> bool {
        self.parent_task_id.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub name: String,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub difficulty: Option<i32>,
    pub schedule_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_repeating: bool,
    pub recurrence: Option<RecurrenceRule>,
    #[serde(default)]
    pub generate_reminders: bool,
    pub reminder_advance_minutes: Option<i64>,
    #[serde(default)]
    pub reminder_methods: Vec<String>,
    pub reminder_targets: Option<String>,
}

impl CreateTaskRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("Task name cannot be empty"));
        }
        validate_level("priority", self.priority.unwrap_or(DEFAULT_PRIORITY))?;
        validate_level("difficulty", self.difficulty.unwrap_or(DEFAULT_DIFFICULTY))?;
        validate_window(self.schedule_time, self.deadline, self.duration_minutes)?;

        match (&self.recurrence, self.is_repeating) {
            (Some(rule), true) => {
                rule.validate()?;
                if matches!(rule.end_date, Some(end) if end < self.schedule_time) {
                    return Err(AppError::validation(
                        "Repeat end date cannot be before the schedule time",
                    ));
                }
            }
            (None, true) => {
                return Err(AppError::validation(
                    "Repeating tasks require a recurrence rule",
                ))
            }
            (Some(_), false) => {
                return Err(AppError::validation(
                    "Recurrence rule given for a non-repeating task",
                ))
            }
            (None, false) => {}
        }

        if matches!(self.reminder_advance_minutes, Some(v) if v < 0) {
            return Err(AppError::validation("Reminder advance minutes cannot be negative"));
        }
        parse_methods(&self.reminder_methods)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub difficulty: Option<i32>,
    pub status: Option<TaskStatus>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub deadline: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
    pub generate_reminders: Option<bool>,
    pub reminder_advance_minutes: Option<i64>,
    pub reminder_methods: Option<Vec<String>>,
    pub reminder_targets: Option<String>,
}

impl UpdateTaskRequest {
    pub fn validate(&self) -> AppResult<()> {
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(AppError::validation("Task name cannot be empty"));
        }
        if let Some(priority) = self.priority {
            validate_level("priority", priority)?;
        }
        if let Some(difficulty) = self.difficulty {
            validate_level("difficulty", difficulty)?;
        }
        if matches!(self.reminder_advance_minutes, Some(v) if v < 0) {
            return Err(AppError::validation("Reminder advance minutes cannot be negative"));
        }
        if let Some(methods) = &self.reminder_methods {
            parse_methods(methods)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksRequest {
    pub search: Option<String>,
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub priority: Option<i32>,
    pub difficulty: Option<i32>,
    pub parent_task_id: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// Outcome of one recurring top-up pass.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopUpReport {
    pub parents_checked: usize,
    pub instances_created: usize,
    pub reminders_created: usize,
    pub failures: usize,
}

pub fn validate_level(label: &str, value: i32) -> AppResult<()> {
    if !(1..=5).contains(&value) {
        return Err(AppError::validation(format!(
            "Task {} must be between 1 and 5",
            label
        )));
    }
    Ok(())
}

pub fn validate_window(
    schedule_time: DateTime<Utc>,
    deadline: DateTime<Utc>,
    duration_minutes: i64,
) -> AppResult<()> {
    if duration_minutes < 1 {
        return Err(AppError::validation("Task duration must be at least 1 minute"));
    }
    if schedule_time > deadline {
        return Err(AppError::validation(
            "Task schedule time cannot be after its deadline",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use TaskStatus::*;
        let allowed = [
            (Pending, Running),
            (Pending, Failed),
            (Running, Completed),
            (Running, Failed),
            (Failed, Pending),
        ];
        for from in [Pending, Running, Completed, Failed] {
            for to in [Pending, Running, Completed, Failed] {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
        assert!(Completed.is_terminal());
    }

    #[test]
    fn window_validation() {
        let start = Utc::now();
        assert!(validate_window(start, start, 1).is_ok());
        assert!(validate_window(start, start - Duration::minutes(1), 10).is_err());
        assert!(validate_window(start, start, 0).is_err());
        assert!(validate_level("priority", 6).is_err());
        assert!(validate_level("priority", 1).is_ok());
    }
}
