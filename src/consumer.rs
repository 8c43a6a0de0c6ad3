//! NATS subscriptions for incoming service requests

use anyhow::{Context, Result};
use async_nats::{Client, Subscriber};
use tracing::info;

/// Subscribes to one request subject, optionally as a member of a queue group.
///
/// Replicas sharing a queue group split the subject's messages between them,
/// so each image is classified by exactly one memory-bounded process.
pub struct RequestConsumer {
    client: Client,
    subject: String,
    queue_group: Option<String>,
}

impl RequestConsumer {
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
            queue_group: None,
        }
    }

    /// Join `group` when subscribing. `None` receives every message.
    pub fn in_queue_group(mut self, group: Option<&str>) -> Self {
        self.queue_group = group.map(str::to_string);
        self
    }

    pub async fn subscribe(self) -> Result<Subscriber> {
        let subscriber = match self.queue_group {
            Some(group) => {
                let subscriber = self
                    .client
                    .queue_subscribe(self.subject.clone(), group.clone())
                    .await
                    .with_context(|| format!("Failed to join queue group {}", group))?;
                info!(subject = %self.subject, queue_group = %group, "Subscribed as queue member");
                subscriber
            }
            None => {
                let subscriber = self
                    .client
                    .subscribe(self.subject.clone())
                    .await
                    .with_context(|| format!("Failed to subscribe to {}", self.subject))?;
                info!(subject = %self.subject, "Subscribed");
                subscriber
            }
        };
        Ok(subscriber)
    }
}
