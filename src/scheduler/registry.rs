use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

pub const TASK_CHECK: &str = "task_check";
pub const REMINDER_DISPATCH: &str = "reminder_dispatch";
pub const URL_CHECK: &str = "url_check";
pub const EXPIRY_CHECK: &str = "task_expiry_check";

/// Handler names the runtime always registers.
pub const BUILTIN_HANDLERS: [&str; 4] = [TASK_CHECK, REMINDER_DISPATCH, URL_CHECK, EXPIRY_CHECK];

/// What a handler gets for one invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub parameters: String,
    pub fired_at: DateTime<Utc>,
    /// Cancelled on shutdown or when the invocation times out.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> AppResult<()>;
}

/// Name to handler table shared by the scheduler and the CLI. Created and
/// torn down by the composition root.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.insert(name.clone(), handler).is_some() {
            log::warn!("Replaced job handler '{}'", name);
        } else {
            log::debug!("Registered job handler '{}'", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
