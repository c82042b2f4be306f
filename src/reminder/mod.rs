pub mod dispatcher;
pub mod models;
mod service;
pub mod storage;

use crate::error::AppResult;
use async_trait::async_trait;

pub use dispatcher::ReminderDispatcher;
pub use models::*;
pub use service::ReminderService;
pub use storage::ReminderStore;

/// The slice of reminder persistence the task side needs. Task code holds
/// this capability instead of the reminder store itself.
#[async_trait]
pub trait ReminderQuery: Send + Sync {
    /// Persists the reminder and its task link in one transaction. An
    /// existing link is left as is.
    async fn create_linked_reminder(&self, reminder: &Reminder, task_id: &str) -> AppResult<()>;

    async fn linked_reminders(&self, task_id: &str) -> AppResult<Vec<Reminder>>;
}
