//! Delivery path for COMMUNICATE.
//!
//! The sink is an injected collaborator; the kernel serializes the inner
//! cognition to canonical text and hands it off. Delivery is at-most-once:
//! a failed hand-off is reported, never retried here.

use std::collections::HashMap;

use ail_types::DeliveryReceipt;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

pub trait CommunicationSink: Send + Sync {
    /// Deliver a serialized cognition to a recipient. The error string is
    /// wrapped by the evaluator as `ToolFailure{tool="communicate"}`.
    fn deliver(
        &self,
        recipient: String,
        message: String,
        sender: String,
    ) -> BoxFuture<'_, Result<DeliveryReceipt, String>>;
}

/// A message held by a `LocalSink` mailbox.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveredMessage {
    pub message_id: Uuid,
    pub sender: String,
    pub body: String,
    pub delivered_at: chrono::DateTime<Utc>,
}

/// In-process sink with named mailboxes. Recipients must be registered
/// ahead of delivery; an unknown recipient fails the hand-off.
#[derive(Default)]
pub struct LocalSink {
    mailboxes: Mutex<HashMap<String, Vec<DeliveredMessage>>>,
}

impl LocalSink {
    pub fn new() -> Self {
        LocalSink {
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a mailbox for a recipient.
    pub async fn register_recipient(&self, name: &str) {
        self.mailboxes
            .lock()
            .await
            .entry(name.to_string())
            .or_default();
    }

    /// Drain the mailbox for a recipient.
    pub async fn take_messages(&self, name: &str) -> Vec<DeliveredMessage> {
        self.mailboxes
            .lock()
            .await
            .get_mut(name)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

impl CommunicationSink for LocalSink {
    fn deliver(
        &self,
        recipient: String,
        message: String,
        sender: String,
    ) -> BoxFuture<'_, Result<DeliveryReceipt, String>> {
        Box::pin(async move {
            let mut mailboxes = self.mailboxes.lock().await;
            let Some(mailbox) = mailboxes.get_mut(&recipient) else {
                return Err(format!("unknown recipient '{recipient}'"));
            };

            let message_id = Uuid::new_v4();
            let delivered_at = Utc::now();
            mailbox.push(DeliveredMessage {
                message_id,
                sender,
                body: message,
                delivered_at,
            });

            Ok(DeliveryReceipt {
                message_id,
                recipient,
                delivered_at,
            })
        })
    }
}
