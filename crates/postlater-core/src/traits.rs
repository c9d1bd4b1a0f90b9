//! Collaborator traits: persistence and the remote workspace API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    CredentialKey, CredentialPatch, CredentialRecord, MessagePatch, MessageStatus,
    ScheduledMessage, SentMessage, TokenGrant,
};

/// Per-(workspace, user) credential persistence. At most one record per key.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>>;

    /// Insert a new record. Fails if one already exists for the key.
    async fn create(&self, record: CredentialRecord) -> Result<CredentialRecord>;

    /// Insert or replace the record for the key, keeping the original `created_at`.
    async fn upsert(&self, record: CredentialRecord) -> Result<CredentialRecord>;

    /// Atomic per-key partial update. `Ok(None)` if there is no record.
    async fn update(
        &self,
        key: &CredentialKey,
        patch: CredentialPatch,
    ) -> Result<Option<CredentialRecord>>;

    async fn delete(&self, key: &CredentialKey) -> Result<bool>;
}

/// Scheduled-message persistence. Records are never physically removed.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>>;

    async fn create(&self, message: ScheduledMessage) -> Result<ScheduledMessage>;

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<Option<ScheduledMessage>>;

    /// Compare-and-set: applies `patch` only while the stored status equals
    /// `expected`. `Ok(None)` when the message is absent or the status differs.
    async fn update_if_status(
        &self,
        id: &str,
        expected: MessageStatus,
        patch: MessagePatch,
    ) -> Result<Option<ScheduledMessage>>;

    /// Pending messages with `scheduled_for <= now`.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>>;

    async fn list_by_owner(&self, owner: &CredentialKey) -> Result<Vec<ScheduledMessage>>;
}

/// A live client bound to one access token.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_message(&self, channel: &str, text: &str) -> Result<SentMessage>;
}

/// Entry point to the remote API: token refresh and client construction.
#[async_trait]
pub trait ApiConnector: Send + Sync {
    async fn refresh_credential(&self, refresh_token: &str) -> Result<TokenGrant>;

    fn connect(&self, access_token: &str) -> Arc<dyn MessagingClient>;
}
