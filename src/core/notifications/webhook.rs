use async_trait::async_trait;
use serde_json::json;

use super::{JobEvent, NotificationChannel};
use crate::error::{Result, SyncError};

/// POSTs job events as JSON to a configured webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    fn format_payload(&self, event: &JobEvent) -> serde_json::Value {
        match event {
            JobEvent::Completed {
                job_id,
                target,
                operation,
                message,
            } => json!({
                "event": format!("{operation}_completed"),
                "job_id": job_id,
                "target": target,
                "message": message,
            }),
            JobEvent::Failed {
                job_id,
                target,
                operation,
                error,
            } => json!({
                "event": format!("{operation}_failed"),
                "job_id": job_id,
                "target": target,
                "error": error,
            }),
            JobEvent::HealthReport { results } => {
                let failed: Vec<_> = results
                    .iter()
                    .filter_map(|(name, error)| {
                        error.as_ref().map(|e| json!({ "target": name, "error": e }))
                    })
                    .collect();
                json!({
                    "event": "health_report",
                    "checked": results.len(),
                    "failed": failed,
                })
            }
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_payload(&event);
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| SyncError::Storage(format!("webhook notification: {e}")))?;
        Ok(())
    }
}
