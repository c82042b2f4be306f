pub mod models;
pub mod recurrence;
mod service;
pub mod storage;

pub use models::*;
pub use recurrence::{RecurrenceRule, RepeatPattern};
pub use service::{TaskManager, DEFAULT_INSTANCE_BATCH, MIN_UPCOMING_INSTANCES};
pub use storage::TaskStore;
