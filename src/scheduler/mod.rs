pub mod expiry;
pub mod handlers;
pub mod jobs;
pub mod registry;

use crate::clock::Clock;
use crate::error::AppResult;
use crate::security::redact_sensitive_text;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use expiry::{ExpiryEvent, ExpiryStore, ExpiryWatcher, InMemoryExpiryStore, EXPIRY_CHANNEL};
pub use jobs::{JobDefinition, JobFile, JobPlan, JobSpec};
pub use registry::{HandlerRegistry, JobContext, JobHandler};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// How one handler invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed,
    Failed(String),
    TimedOut,
    /// The previous tick of the same job is still running.
    Busy,
    NoHandler,
}

/// Runs handlers for scheduled jobs: one invocation per job name at a time,
/// bounded by the handler timeout. Errors never leave this type.
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    handler_timeout: Duration,
    guards: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl JobRunner {
    pub fn new(registry: Arc<HandlerRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            guards: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    fn guard_for(&self, job_name: &str) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(job_name.to_string())
            .or_default()
            .clone()
    }

    pub async fn invoke(&self, job: &JobDefinition, cancel: &CancellationToken) -> InvocationOutcome {
        let Ok(_running) = self.guard_for(&job.name).try_lock_owned() else {
            log::warn!("Job '{}' is still running, skipping this tick", job.name);
            return InvocationOutcome::Busy;
        };

        let Some(handler) = self.registry.get(&job.handler) else {
            log::warn!("No handler found for function '{}' of job '{}'", job.handler, job.name);
            return InvocationOutcome::NoHandler;
        };

        let token = cancel.child_token();
        let ctx = JobContext {
            job_name: job.name.clone(),
            parameters: job.parameters.clone(),
            fired_at: self.clock.now(),
            cancel: token.clone(),
        };

        log::debug!("Executing function '{}' with parameter '{}'", job.handler, job.parameters);
        let started = Instant::now();
        match tokio::time::timeout(self.handler_timeout, handler.execute(ctx)).await {
            Ok(Ok(())) => {
                log::debug!("Job '{}' finished in {:?}", job.name, started.elapsed());
                InvocationOutcome::Completed
            }
            Ok(Err(err)) => {
                let message = redact_sensitive_text(&err.to_string());
                log::error!("Error executing job '{}': {}", job.name, message);
                InvocationOutcome::Failed(message)
            }
            Err(_) => {
                token.cancel();
                log::error!(
                    "Job '{}' exceeded its {:?} timeout and was abandoned",
                    job.name,
                    self.handler_timeout
                );
                InvocationOutcome::TimedOut
            }
        }
    }
}

/// Cron loop over a fixed set of jobs. Each job gets its own timing loop;
/// handlers run on spawned tasks so a slow one never delays a tick.
pub struct Scheduler {
    jobs: Vec<Arc<JobDefinition>>,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub fn new(plan: JobPlan, runner: JobRunner, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: plan.jobs.into_iter().map(Arc::new).collect(),
            runner,
            clock,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobDefinition> {
        self.jobs.iter().map(|job| job.as_ref())
    }

    /// Writes every job deadline into the expiry store.
    pub async fn record_deadlines(&self, watcher: &ExpiryWatcher) -> AppResult<()> {
        for job in &self.jobs {
            if let Some(deadline) = job.deadline {
                watcher.record_deadline(&job.name, deadline).await?;
            }
        }
        Ok(())
    }

    /// Runs until `cancel` fires, then waits up to the shutdown grace for
    /// in-flight handlers.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut loops = JoinSet::new();

        for job in &self.jobs {
            log::info!("Scheduled job '{}' with schedule '{}'", job.name, job.expression);
            loops.spawn(drive(
                job.clone(),
                self.runner.clone(),
                self.clock.clone(),
                cancel.clone(),
                tracker.clone(),
            ));
        }
        log::info!("Scheduler started with {} jobs", self.jobs.len());

        while let Some(result) = loops.join_next().await {
            if let Err(err) = result {
                log::error!("Scheduler loop ended abnormally: {}", err);
            }
        }

        tracker.close();
        if !tracker.is_empty() {
            log::info!("Waiting for {} running jobs to stop", tracker.len());
        }
        if tokio::time::timeout(self.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "{} jobs still running after {:?}, abandoning them",
                tracker.len(),
                self.shutdown_grace
            );
        }
        log::info!("Scheduler stopped");
    }
}

async fn drive(
    job: Arc<JobDefinition>,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut last_fire = clock.now();
    loop {
        let now = clock.now();
        let next = match job.next_after(now.max(last_fire)) {
            Ok(next) => next,
            Err(err) => {
                log::error!("{}", err);
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = next;

        let job = job.clone();
        let runner = runner.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            runner.invoke(&job, &cancel).await;
        });
    }
}

#[cfg(test)]
mod tests;
