use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::reminder::ReminderDispatcher;
use crate::scheduler::registry::{JobContext, JobHandler};
use crate::task_manager::TaskManager;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

const DEFAULT_BACKFILL_LOOKAHEAD_HOURS: i64 = 24;
const URL_CHECK_TIMEOUT_SECS: u64 = 30;

/// Tops up recurring instances, then backfills reminders for tasks
/// scheduled within the lookahead. The parameter, when set, is the
/// lookahead in hours.
pub struct TaskCheckHandler {
    tasks: TaskManager,
    clock: Arc<dyn Clock>,
}

impl TaskCheckHandler {
    pub fn new(tasks: TaskManager, clock: Arc<dyn Clock>) -> Self {
        Self { tasks, clock }
    }
}

fn lookahead_hours(raw: &str) -> AppResult<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(DEFAULT_BACKFILL_LOOKAHEAD_HOURS);
    }
    match raw.parse::<i64>() {
        Ok(hours) if hours > 0 => Ok(hours),
        _ => Err(AppError::validation(format!(
            "task_check lookahead must be a positive number of hours, got '{}'",
            raw
        ))),
    }
}

#[async_trait]
impl JobHandler for TaskCheckHandler {
    async fn execute(&self, ctx: JobContext) -> AppResult<()> {
        let lookahead = Duration::hours(lookahead_hours(&ctx.parameters)?);
        let now = self.clock.now();

        let report = self.tasks.top_up_instances(now).await?;
        if ctx.cancel.is_cancelled() {
            log::warn!("Task check cancelled after instance top-up");
            return Ok(());
        }
        let backfilled = self.tasks.backfill_reminders(now, lookahead).await?;

        log::info!(
            "Task check completed: {} instances, {} reminders from top-up, {} backfilled",
            report.instances_created,
            report.reminders_created,
            backfilled
        );
        Ok(())
    }
}

pub struct ReminderDispatchHandler {
    dispatcher: ReminderDispatcher,
}

impl ReminderDispatchHandler {
    pub fn new(dispatcher: ReminderDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for ReminderDispatchHandler {
    async fn execute(&self, ctx: JobContext) -> AppResult<()> {
        self.dispatcher.run_once(&ctx.cancel).await.map(|_| ())
    }
}

/// GETs the URL given as parameter and logs the response status.
pub struct UrlCheckHandler {
    client: reqwest::Client,
}

impl UrlCheckHandler {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(URL_CHECK_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JobHandler for UrlCheckHandler {
    async fn execute(&self, ctx: JobContext) -> AppResult<()> {
        let url = ctx.parameters.trim();
        if url.is_empty() {
            return Err(AppError::validation(format!(
                "Job '{}' needs a URL parameter",
                ctx.job_name
            )));
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            let message = format!("Failed to fetch '{}': {}", url, e);
            if e.is_builder() {
                AppError::validation(message)
            } else {
                AppError::Transient(message)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            log::info!("URL check of '{}' returned {}", url, status);
        } else {
            log::warn!("URL check of '{}' returned {}", url, status);
        }
        Ok(())
    }
}
