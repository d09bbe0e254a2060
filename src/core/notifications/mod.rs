mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::NotificationConfig;
use crate::core::models::JobOperation;
use crate::error::Result;

/// Events surfaced to the notifier hook.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed {
        job_id: i64,
        target: String,
        operation: JobOperation,
        message: String,
    },
    Failed {
        job_id: i64,
        target: String,
        operation: JobOperation,
        error: String,
    },
    /// Health probe outcome per enabled target; `None` means healthy.
    HealthReport {
        results: HashMap<String, Option<String>>,
    },
}

/// Trait for notification channel implementations.
///
/// Email delivery lives in the admin layer; the daemon itself only ships a
/// webhook channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Create a notifier from config, or `None` when notifications are off.
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    let url = config.webhook_url.as_ref()?;
    if url.is_empty() {
        return None;
    }
    Some(Arc::new(webhook::WebhookNotifier::new(url.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_webhook_url_disables_notifications() {
        let mut config = NotificationConfig::default();
        assert!(create_notifier(&config).is_none());

        config.webhook_url = Some(String::new());
        assert!(create_notifier(&config).is_none());

        config.webhook_url = Some("https://hooks.example.com/vwsyncd".into());
        assert!(create_notifier(&config).is_some());
    }
}
