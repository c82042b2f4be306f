use crate::channels::{ChannelAdapter, DeliveryMethod, DeliveryOutcome, RecipientProfile};
use crate::reminder::Reminder;
use async_trait::async_trait;

/// Stand-in for channels whose transport lives outside this service
/// (webhook, IM). Never fails, always reports `not-implemented`.
pub struct PlaceholderAdapter {
    method: DeliveryMethod,
}

impl PlaceholderAdapter {
    pub fn new(method: DeliveryMethod) -> Self {
        Self { method }
    }
}

#[async_trait]
impl ChannelAdapter for PlaceholderAdapter {
    fn method(&self) -> DeliveryMethod {
        self.method
    }

    async fn send(&self, reminder: &Reminder, recipient: &RecipientProfile) -> DeliveryOutcome {
        log::debug!(
            "{} delivery of reminder '{}' to '{}' is not implemented",
            self.method,
            reminder.id,
            recipient.user_id
        );
        DeliveryOutcome::Skipped("not-implemented".to_string())
    }
}
