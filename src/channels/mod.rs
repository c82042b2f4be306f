pub mod directory;
pub mod email;
pub mod placeholder;
pub mod smtp;

use crate::error::{AppError, AppResult};
use crate::reminder::Reminder;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use directory::{RecipientDirectory, SqliteRecipientDirectory, StaticRecipientDirectory};

/// Delivery kinds a reminder can request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Email,
    Webhook,
    Im,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Im => "im",
        }
    }

    /// Case-insensitive; `message` is accepted as a legacy spelling of `im`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "email" => Some(Self::Email),
            "webhook" => Some(Self::Webhook),
            "im" | "message" => Some(Self::Im),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses delivery methods, removing duplicates. An empty list falls back
/// to email.
pub fn parse_methods(raw: &[String]) -> AppResult<Vec<DeliveryMethod>> {
    let mut methods = Vec::new();
    for value in raw {
        if value.trim().is_empty() {
            continue;
        }
        let method = DeliveryMethod::parse(value)
            .ok_or_else(|| AppError::validation(format!("Unknown reminder method: {}", value)))?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    if methods.is_empty() {
        methods.push(DeliveryMethod::Email);
    }
    Ok(methods)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// Worth retrying on the next tick (4xx replies, network trouble).
    Transient,
    /// Retrying cannot help (bad target, rejected credentials).
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
}

impl ChannelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ChannelErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ChannelErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ChannelErrorKind::Transient
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ChannelErrorKind::Transient => "transient",
            ChannelErrorKind::Permanent => "permanent",
        };
        write!(f, "{} error: {}", kind, self.message)
    }
}

/// What a single adapter did with a reminder. The dispatcher branches on
/// this tag only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Skipped(String),
    Failed(ChannelError),
}

/// Contact details of the user a reminder is delivered to.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientProfile {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub im_handle: Option<String>,
}

impl RecipientProfile {
    /// Whether the profile carries an address usable by `method`.
    pub fn has_contact_for(&self, method: DeliveryMethod) -> bool {
        let value = match method {
            DeliveryMethod::Email => &self.email,
            DeliveryMethod::Webhook => &self.webhook_url,
            DeliveryMethod::Im => &self.im_handle,
        };
        value.as_deref().is_some_and(|v| !v.trim().is_empty())
    }
}

/// A delivery sink. Implementations are shared between ticks and must be
/// reentrant; they report problems through [`DeliveryOutcome`] instead of
/// returning errors.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn method(&self) -> DeliveryMethod;

    async fn send(&self, reminder: &Reminder, recipient: &RecipientProfile) -> DeliveryOutcome;
}

/// Adapters keyed by delivery method.
#[derive(Clone, Default)]
pub struct ChannelSet {
    adapters: HashMap<DeliveryMethod, Arc<dyn ChannelAdapter>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the same method.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let method = adapter.method();
        if self.adapters.insert(method, adapter).is_some() {
            log::warn!("Replaced channel adapter for '{}'", method);
        }
    }

    pub fn with(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, method: DeliveryMethod) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&method).cloned()
    }

    pub fn methods(&self) -> Vec<DeliveryMethod> {
        let mut methods: Vec<_> = self.adapters.keys().copied().collect();
        methods.sort_by_key(|m| m.as_str());
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_default_and_dedupe() {
        assert_eq!(parse_methods(&[]).expect("default"), vec![DeliveryMethod::Email]);
        let parsed = parse_methods(&["Email".into(), "message".into(), "email".into()]).expect("parse");
        assert_eq!(parsed, vec![DeliveryMethod::Email, DeliveryMethod::Im]);
        assert!(parse_methods(&["pigeon".into()]).is_err());
    }

    #[test]
    fn contact_lookup_ignores_blank_values() {
        let profile = RecipientProfile {
            user_id: "u1".into(),
            username: "alice".into(),
            email: Some("  ".into()),
            webhook_url: Some("https://hooks.example.com/a".into()),
            im_handle: None,
        };
        assert!(!profile.has_contact_for(DeliveryMethod::Email));
        assert!(profile.has_contact_for(DeliveryMethod::Webhook));
        assert!(!profile.has_contact_for(DeliveryMethod::Im));
    }

    #[test]
    fn channel_set_lists_registered_methods() {
        let set = ChannelSet::new()
            .with(Arc::new(placeholder::PlaceholderAdapter::new(DeliveryMethod::Webhook)))
            .with(Arc::new(placeholder::PlaceholderAdapter::new(DeliveryMethod::Im)));
        assert_eq!(set.methods(), vec![DeliveryMethod::Im, DeliveryMethod::Webhook]);
        assert!(set.get(DeliveryMethod::Email).is_none());
    }
}
