//! Delivery engine: drives one message through `pending → sending → sent | failed`.
//!
//! Every status write goes through [`MessageStore::update_if_status`], so the
//! first writer of `sending` owns the attempt and any concurrent caller
//! observes a non-pending message and returns without side effects. Failures
//! never leave this module: they end up in the message's `status` and
//! `error_message`.

use chrono::Utc;
use std::sync::Arc;

use postlater_core::error::{PostlaterError, Result};
use postlater_core::traits::MessageStore;
use postlater_core::types::{MessagePatch, MessageStatus, ScheduledMessage, SentMessage};

use crate::cache::ClientCache;

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The message already left `pending`.
    Rejected(MessageStatus),
}

pub struct DeliveryEngine {
    messages: Arc<dyn MessageStore>,
    clients: Arc<ClientCache>,
}

impl DeliveryEngine {
    pub fn new(messages: Arc<dyn MessageStore>, clients: Arc<ClientCache>) -> Self {
        Self { messages, clients }
    }

    /// Attempt delivery of one message. A no-op unless it is exactly `pending`.
    /// Outcomes are observable only through the stored message.
    pub async fn deliver(&self, message_id: &str) {
        if let Err(e) = self.try_deliver(message_id).await {
            tracing::error!(message_id, "delivery aborted by store failure: {e}");
        }
    }

    /// Immediate send: deliver inline, then return the stored result.
    pub async fn deliver_now(&self, message_id: &str) -> Result<Option<ScheduledMessage>> {
        self.deliver(message_id).await;
        self.messages.get(message_id).await
    }

    /// Cancel a message that has not started delivery.
    pub async fn cancel(&self, message_id: &str) -> Result<CancelOutcome> {
        let cancelled = self
            .transition(message_id, MessageStatus::Pending, MessagePatch::status(MessageStatus::Cancelled))
            .await?;
        if cancelled.is_some() {
            tracing::info!(message_id, "message cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        Ok(match self.messages.get(message_id).await? {
            None => CancelOutcome::NotFound,
            Some(message) => {
                tracing::debug!(message_id, status = %message.status, "cancel rejected");
                CancelOutcome::Rejected(message.status)
            }
        })
    }

    async fn try_deliver(&self, message_id: &str) -> Result<()> {
        let Some(message) = self.messages.get(message_id).await? else {
            tracing::debug!(message_id, "message not found, nothing to deliver");
            return Ok(());
        };
        if message.status != MessageStatus::Pending {
            tracing::debug!(message_id, status = %message.status, "not pending, skipping");
            return Ok(());
        }

        let claimed = self
            .transition(message_id, MessageStatus::Pending, MessagePatch::status(MessageStatus::Sending))
            .await?;
        let Some(message) = claimed else {
            tracing::debug!(message_id, "another delivery claimed the message first");
            return Ok(());
        };

        let patch = match self.send(&message).await {
            Ok(sent) => {
                tracing::info!(
                    message_id,
                    channel = %sent.channel,
                    remote_ts = %sent.remote_ts,
                    "message sent"
                );
                MessagePatch::sent(Utc::now())
            }
            Err(e) => {
                if e.is_auth_failure() {
                    self.clients.invalidate(&message.owner()).await;
                }
                tracing::warn!(message_id, workspace_id = %message.workspace_id, "delivery failed: {e}");
                MessagePatch::failed(failure_reason(&e))
            }
        };

        if self.transition(message_id, MessageStatus::Sending, patch).await?.is_none() {
            tracing::warn!(message_id, "message left 'sending' during delivery, outcome dropped");
        }
        Ok(())
    }

    async fn send(&self, message: &ScheduledMessage) -> Result<SentMessage> {
        let client = self.clients.try_resolve_client(&message.owner()).await?;
        client.send_message(&message.channel_id, &message.content).await
    }

    /// Apply a status change if it is a legal edge and the stored status is still
    /// `from`. Illegal edges are ignored: they come from benign races.
    async fn transition(
        &self,
        message_id: &str,
        from: MessageStatus,
        patch: MessagePatch,
    ) -> Result<Option<ScheduledMessage>> {
        match patch.status {
            Some(to) if from.can_transition_to(to) => {
                self.messages.update_if_status(message_id, from, patch).await
            }
            to => {
                tracing::debug!(message_id, %from, ?to, "ignoring illegal transition");
                Ok(None)
            }
        }
    }
}

/// Human-readable cause stored on a failed message. Remote codes pass through unchanged.
fn failure_reason(e: &PostlaterError) -> String {
    match e {
        PostlaterError::RemoteApi { code } => code.clone(),
        PostlaterError::CredentialMissing(reason) => format!("workspace not connected: {reason}"),
        PostlaterError::RefreshFailed(reason) => format!("could not refresh workspace credentials: {reason}"),
        other => other.to_string(),
    }
}
