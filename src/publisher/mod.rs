//! Publisher
//!
//! Sends one `TaskMessage` to a `Target` and waits, for at most a fixed
//! timeout, for the broker to take it. A publish that does not complete in
//! time fails with `TaskError::PublishTimeout` and is not retried; whether the
//! broker eventually enqueued the message is unknown to the caller.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::message::TaskMessage;
use crate::broker::{BrokerReceipt, Target};
use crate::config::PublisherSettings;
use crate::session::Session;
use crate::utils::error::{Result, TaskError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a publish the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub receipt: BrokerReceipt,
    pub message_id: String,
}

#[derive(Clone)]
pub struct Publisher {
    session: Session,
    timeout: Duration,
    content_type: String,
}

impl Publisher {
    pub fn new(session: Session, timeout: Duration) -> Self {
        Self {
            session,
            timeout,
            content_type: "text/plain".to_string(),
        }
    }

    pub fn from_settings(session: Session, settings: &PublisherSettings) -> Self {
        Self::new(session, Duration::from_secs(settings.timeout_secs))
            .with_content_type(&settings.content_type)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publishes `body` to `target`. `durable` asks the broker to persist the
    /// message (delivery mode 2).
    pub async fn publish(
        &self,
        target: &Target,
        body: impl Into<Vec<u8>>,
        durable: bool,
    ) -> Result<PublishAck> {
        let message = TaskMessage::new(body)
            .with_durable(durable)
            .with_content_type(self.content_type.as_str())
            .with_routing_key(target.routing_key.as_str());
        self.publish_message(target, &message).await
    }

    /// Publishes a prebuilt message as is.
    pub async fn publish_message(
        &self,
        target: &Target,
        message: &TaskMessage,
    ) -> Result<PublishAck> {
        debug!(
            exchange = %target.exchange,
            routing_key = %target.routing_key,
            message_id = message.message_id(),
            durable = message.durable(),
            "Publishing"
        );

        let sent = tokio::time::timeout(
            self.timeout,
            self.session.channel().publish(target, message),
        )
        .await;

        let receipt = match sent {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    exchange = %target.exchange,
                    routing_key = %target.routing_key,
                    timeout = ?self.timeout,
                    "Publish timed out"
                );
                return Err(TaskError::PublishTimeout(self.timeout));
            }
        };

        info!(
            message_id = message.message_id(),
            receipt = ?receipt,
            "Published"
        );
        Ok(PublishAck {
            receipt,
            message_id: message.message_id().to_string(),
        })
    }
}
