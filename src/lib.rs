pub mod api;
pub mod channels;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod reminder;
pub mod scheduler;
pub mod security;
pub mod task_manager;
pub mod vault;

use crate::api::ApiState;
use crate::channels::email::{EmailAdapter, MailConfig, MailTransport, Mailer};
use crate::channels::placeholder::PlaceholderAdapter;
use crate::channels::smtp::SmtpTransport;
use crate::channels::{ChannelErrorKind, ChannelSet, DeliveryMethod, SqliteRecipientDirectory};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::reminder::{ReminderDispatcher, ReminderService, ReminderStore};
use crate::scheduler::handlers::{ReminderDispatchHandler, TaskCheckHandler, UrlCheckHandler};
use crate::scheduler::jobs::{load_job_file, plan_jobs};
use crate::scheduler::registry::{EXPIRY_CHECK, REMINDER_DISPATCH, TASK_CHECK, URL_CHECK};
use crate::scheduler::{
    ExpiryWatcher, HandlerRegistry, InMemoryExpiryStore, InvocationOutcome, JobDefinition, JobFile,
    JobPlan, JobRunner, Scheduler,
};
use crate::task_manager::{TaskManager, TaskStore};
use crate::vault::{KeyProvider, KeyRing, SecretStore, SecretVault};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Every long-lived service of the process, wired once at startup and torn
/// down explicitly by [`Runtime::shutdown`].
pub struct Runtime {
    pub config: AppConfig,
    pub pool: Pool<Sqlite>,
    pub clock: Arc<dyn Clock>,
    pub tasks: TaskManager,
    pub reminders: ReminderService,
    pub dispatcher: ReminderDispatcher,
    pub vault: SecretVault,
    pub registry: Arc<HandlerRegistry>,
    pub expiry: ExpiryWatcher,
    pub mailer: Option<Mailer>,
}

impl Runtime {
    /// Opens the database and reads key material and mail settings from the
    /// environment. A configured mail server that cannot be used is fatal.
    pub async fn init(config: AppConfig) -> AppResult<Self> {
        let pool = db::create_pool(&config.database_url).await?;
        if config.skip_db_init {
            log::info!("Skipping schema initialization (SKIP_DB_INIT)");
        } else {
            db::init_schema(&pool).await?;
        }

        let keys: Arc<dyn KeyProvider> = Arc::new(KeyRing::from_env()?);
        let mail = match MailConfig::from_env()? {
            Some(mail_config) => {
                let transport: Arc<dyn MailTransport> = Arc::new(SmtpTransport::new(&mail_config)?);
                Some((mail_config, transport))
            }
            None => {
                log::warn!("MAIL_SERVER is not set, email delivery is disabled");
                None
            }
        };

        Self::assemble(config, pool, Arc::new(SystemClock), keys, mail)
    }

    /// Wires services over an already prepared pool.
    pub fn assemble(
        config: AppConfig,
        pool: Pool<Sqlite>,
        clock: Arc<dyn Clock>,
        keys: Arc<dyn KeyProvider>,
        mail: Option<(MailConfig, Arc<dyn MailTransport>)>,
    ) -> AppResult<Self> {
        let reminder_store = ReminderStore::new(pool.clone());
        let reminders = ReminderService::new(reminder_store.clone(), clock.clone());
        let tasks = TaskManager::new(
            TaskStore::new(pool.clone()),
            Arc::new(reminder_store.clone()),
            clock.clone(),
        )
        .with_instance_batch(config.instance_batch);
        let vault = SecretVault::new(SecretStore::new(pool.clone()), keys, clock.clone());

        let mailer = mail.map(|(mail_config, transport)| Mailer::new(&mail_config, transport, clock.clone()));
        let mut channels = ChannelSet::new();
        if let Some(mailer) = &mailer {
            channels.register(Arc::new(EmailAdapter::new(mailer.clone())));
        }
        channels.register(Arc::new(PlaceholderAdapter::new(DeliveryMethod::Webhook)));
        channels.register(Arc::new(PlaceholderAdapter::new(DeliveryMethod::Im)));

        let dispatcher = ReminderDispatcher::new(
            reminder_store,
            Arc::new(SqliteRecipientDirectory::new(pool.clone())),
            channels,
            clock.clone(),
        );

        let expiry = ExpiryWatcher::new(Arc::new(InMemoryExpiryStore::new()), clock.clone());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(TASK_CHECK, Arc::new(TaskCheckHandler::new(tasks.clone(), clock.clone())));
        registry.register(
            REMINDER_DISPATCH,
            Arc::new(ReminderDispatchHandler::new(dispatcher.clone())),
        );
        registry.register(URL_CHECK, Arc::new(UrlCheckHandler::new()?));
        registry.register(EXPIRY_CHECK, Arc::new(expiry.clone()));

        Ok(Self {
            config,
            pool,
            clock,
            tasks,
            reminders,
            dispatcher,
            vault,
            registry,
            expiry,
            mailer,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            tasks: self.tasks.clone(),
            reminders: self.reminders.clone(),
            dispatcher: self.dispatcher.clone(),
            vault: self.vault.clone(),
        }
    }

    /// Loads the configured job file. A missing file leaves only the
    /// default jobs.
    pub fn load_jobs(&self) -> AppResult<JobFile> {
        read_job_file(&self.config.jobs_file)
    }

    pub fn plan(&self, file: &JobFile) -> AppResult<JobPlan> {
        let plan = plan_jobs(file, |name| self.registry.contains(name))?;
        for warning in &plan.warnings {
            log::warn!("{}", warning);
        }
        Ok(plan)
    }

    fn runner(&self) -> JobRunner {
        JobRunner::new(self.registry.clone(), self.clock.clone())
            .with_handler_timeout(self.config.handler_timeout)
    }

    /// Runs one handler immediately, outside any schedule.
    pub async fn run_job(&self, handler: &str, parameters: &str) -> AppResult<()> {
        if !self.registry.contains(handler) {
            return Err(AppError::not_found(format!("Job handler '{}' not found", handler)));
        }
        let job = JobDefinition::new(
            format!("manual:{}", handler),
            "* * * * * *",
            handler,
            parameters,
        )?;

        match self.runner().invoke(&job, &CancellationToken::new()).await {
            InvocationOutcome::Completed => Ok(()),
            InvocationOutcome::Failed(message) => Err(AppError::internal(message)),
            InvocationOutcome::TimedOut => Err(AppError::Transient(format!(
                "Job handler '{}' timed out after {:?}",
                handler, self.config.handler_timeout
            ))),
            InvocationOutcome::Busy => Err(AppError::conflict(format!(
                "Job handler '{}' is already running",
                handler
            ))),
            InvocationOutcome::NoHandler => {
                Err(AppError::not_found(format!("Job handler '{}' not found", handler)))
            }
        }
    }

    /// Runs the scheduler and the HTTP API until `cancel` fires, then waits
    /// for both to wind down.
    pub async fn serve(&self, plan: JobPlan, cancel: CancellationToken) -> AppResult<()> {
        let scheduler = Scheduler::new(plan, self.runner(), self.clock.clone())
            .with_shutdown_grace(self.config.shutdown_grace);
        scheduler.record_deadlines(&self.expiry).await?;

        let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));
        let api_result = api::serve(self.api_state(), self.config.http_bind, cancel.clone()).await;
        if api_result.is_err() {
            cancel.cancel();
        }

        if let Err(err) = scheduler_task.await {
            log::error!("Scheduler task ended abnormally: {}", err);
        }
        api_result
    }

    /// Releases handlers and closes the pool.
    pub async fn shutdown(self) {
        self.registry.clear();
        self.pool.close().await;
        log::info!("Shutdown complete");
    }
}

fn read_job_file(path: &Path) -> AppResult<JobFile> {
    if !path.exists() {
        log::warn!(
            "Job file '{}' not found, running default jobs only",
            path.display()
        );
        return Ok(JobFile::default());
    }
    load_job_file(path)
}

/// Process entry for `serve`: init, run until Ctrl-C, tear down.
pub async fn run(config: AppConfig) -> AppResult<()> {
    let runtime = Runtime::init(config).await?;
    let plan = runtime.load_jobs().and_then(|file| runtime.plan(&file));
    let plan = match plan {
        Ok(plan) => plan,
        Err(err) => {
            runtime.shutdown().await;
            return Err(err);
        }
    };
    log::info!(
        "Scheduled {} job(s): {}",
        plan.jobs.len(),
        plan.jobs
            .iter()
            .map(|job| job.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Received shutdown signal"),
            Err(err) => log::error!("Failed to listen for shutdown signal: {}", err),
        }
        signal.cancel();
    });

    let result = runtime.serve(plan, cancel).await;
    runtime.shutdown().await;
    result
}

/// Sends one email through the configured SMTP server.
pub async fn send_mail(subject: &str, body: &str, to: Vec<String>, cc: Vec<String>) -> AppResult<()> {
    let Some(mail_config) = MailConfig::from_env()? else {
        return Err(AppError::configuration("MAIL_SERVER is not configured"));
    };
    let transport = Arc::new(SmtpTransport::new(&mail_config)?);
    let mailer = Mailer::new(&mail_config, transport, Arc::new(SystemClock));
    deliver(&mailer, subject, body, to, cc).await
}

async fn deliver(
    mailer: &Mailer,
    subject: &str,
    body: &str,
    to: Vec<String>,
    cc: Vec<String>,
) -> AppResult<()> {
    let message = mailer
        .compose(subject, body, to, cc)
        .map_err(|e| AppError::validation(e.message))?;
    mailer.send(&message).await.map_err(|e| match e.kind {
        ChannelErrorKind::Transient => AppError::Transient(format!("Failed to send email: {}", e.message)),
        ChannelErrorKind::Permanent => AppError::internal(format!("Failed to send email: {}", e.message)),
    })?;
    log::info!(
        "Email '{}' sent to {}",
        message.subject,
        message.recipients().join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod tests;
