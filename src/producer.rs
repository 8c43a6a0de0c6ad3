//! Publishes JSON replies to requesters

use anyhow::Result;
use async_nats::{Client, Subject};
use serde::Serialize;
use tracing::{debug, warn};

/// Sends replies to the inbox named in each request
#[derive(Clone)]
pub struct ReplyPublisher {
    client: Client,
}

impl ReplyPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Serialize `body` and publish it to `reply_to`.
    ///
    /// Requests published without a reply subject are fire-and-forget; the
    /// reply is dropped.
    pub async fn reply<T: Serialize>(&self, reply_to: Option<Subject>, body: &T) -> Result<()> {
        let Some(subject) = reply_to else {
            warn!("Request has no reply subject, dropping reply");
            return Ok(());
        };

        let payload = serde_json::to_vec(body)?;
        let size = payload.len();
        self.client.publish(subject.clone(), payload.into()).await?;

        debug!(subject = %subject, bytes = size, "Published reply");
        Ok(())
    }
}
