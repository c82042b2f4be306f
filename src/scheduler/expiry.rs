use crate::clock::Clock;
use crate::error::AppResult;
use crate::scheduler::jobs::expiry_key;
use crate::scheduler::registry::{JobContext, JobHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const EXPIRY_CHANNEL: &str = "task_expiry_channel";
const KEY_PREFIX: &str = "task:";
const KEY_SUFFIX: &str = ":expiry";

/// Key/value store for job deadlines, keyed `task:<name>:expiry` with Unix
/// seconds as the value.
#[async_trait]
pub trait ExpiryStore: Send + Sync {
    async fn set(&self, key: &str, expires_at: i64) -> AppResult<()>;
    async fn get(&self, key: &str) -> AppResult<Option<i64>>;
    async fn keys(&self, prefix: &str) -> AppResult<Vec<String>>;
    async fn delete(&self, key: &str) -> AppResult<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryExpiryStore {
    entries: Mutex<BTreeMap<String, i64>>,
}

impl InMemoryExpiryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, i64>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ExpiryStore for InMemoryExpiryStore {
    async fn set(&self, key: &str, expires_at: i64) -> AppResult<()> {
        self.entries().insert(key.to_string(), expires_at);
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<i64>> {
        Ok(self.entries().get(key).copied())
    }

    async fn keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        Ok(self
            .entries()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        Ok(self.entries().remove(key).is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEvent {
    pub channel: &'static str,
    pub job_name: String,
    pub expired_at: DateTime<Utc>,
}

/// Records job deadlines and publishes an event once each one passes.
/// Publishing is fire-and-forget: an event nobody listens to is dropped.
#[derive(Clone)]
pub struct ExpiryWatcher {
    store: Arc<dyn ExpiryStore>,
    events: broadcast::Sender<ExpiryEvent>,
    clock: Arc<dyn Clock>,
}

impl ExpiryWatcher {
    pub fn new(store: Arc<dyn ExpiryStore>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            events,
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpiryEvent> {
        self.events.subscribe()
    }

    pub async fn record_deadline(&self, job_name: &str, deadline: DateTime<Utc>) -> AppResult<()> {
        let key = expiry_key(job_name);
        self.store.set(&key, deadline.timestamp()).await?;
        log::info!("Set expiry time for job '{}': {}", job_name, deadline.timestamp());
        Ok(())
    }

    /// Publishes and removes every deadline at or before `now`. Returns how
    /// many expired.
    pub async fn check(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let keys = self.store.keys(KEY_PREFIX).await?;
        let mut expired = 0;

        for key in keys {
            let Some(job_name) = key
                .strip_prefix(KEY_PREFIX)
                .and_then(|rest| rest.strip_suffix(KEY_SUFFIX))
            else {
                continue;
            };

            let expires_at = match self.store.get(&key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("Failed to read expiry time of '{}': {}", key, err);
                    continue;
                }
            };
            log::debug!("Job '{}': expiry={}, current={}", job_name, expires_at, now.timestamp());
            if now.timestamp() < expires_at {
                continue;
            }

            let event = ExpiryEvent {
                channel: EXPIRY_CHANNEL,
                job_name: job_name.to_string(),
                expired_at: now,
            };
            if self.events.send(event).is_err() {
                log::debug!("No subscribers on {} for job '{}'", EXPIRY_CHANNEL, job_name);
            }
            self.store.delete(&key).await?;
            expired += 1;
            log::info!("Published expiry event for job '{}'", job_name);
        }

        if expired > 0 {
            log::info!("Processed {} expired jobs", expired);
        }
        Ok(expired)
    }
}

#[async_trait]
impl JobHandler for ExpiryWatcher {
    async fn execute(&self, _ctx: JobContext) -> AppResult<()> {
        self.check(self.clock.now()).await.map(|_| ())
    }
}
