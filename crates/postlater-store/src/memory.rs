//! In-memory stores. Nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use postlater_core::error::{PostlaterError, Result};
use postlater_core::traits::{CredentialStore, MessageStore};
use postlater_core::types::{
    CredentialKey, CredentialPatch, CredentialRecord, MessagePatch, MessageStatus,
    ScheduledMessage,
};

/// Credentials keyed by (workspace, user).
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<CredentialKey, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Scheduled messages keyed by id.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, ScheduledMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
        Ok(self.credentials.read().await.get(key).cloned())
    }

    async fn create(&self, record: CredentialRecord) -> Result<CredentialRecord> {
        let mut credentials = self.credentials.write().await;
        let key = record.key();
        if credentials.contains_key(&key) {
            return Err(PostlaterError::Store(format!("credential for {key} already exists")));
        }
        credentials.insert(key, record.clone());
        Ok(record)
    }

    async fn upsert(&self, mut record: CredentialRecord) -> Result<CredentialRecord> {
        let mut credentials = self.credentials.write().await;
        let key = record.key();
        if let Some(existing) = credentials.get(&key) {
            record.created_at = existing.created_at;
        }
        credentials.insert(key, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        key: &CredentialKey,
        patch: CredentialPatch,
    ) -> Result<Option<CredentialRecord>> {
        let mut credentials = self.credentials.write().await;
        Ok(credentials.get_mut(key).map(|record| {
            patch.apply(record, Utc::now());
            record.clone()
        }))
    }

    async fn delete(&self, key: &CredentialKey) -> Result<bool> {
        Ok(self.credentials.write().await.remove(key).is_some())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn create(&self, message: ScheduledMessage) -> Result<ScheduledMessage> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(PostlaterError::Store(format!("message {} already exists", message.id)));
        }
        messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<Option<ScheduledMessage>> {
        let mut messages = self.messages.write().await;
        Ok(messages.get_mut(id).map(|message| {
            patch.apply(message);
            message.clone()
        }))
    }

    async fn update_if_status(
        &self,
        id: &str,
        expected: MessageStatus,
        patch: MessagePatch,
    ) -> Result<Option<ScheduledMessage>> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(id) {
            Some(message) if message.status == expected => {
                patch.apply(message);
                Ok(Some(message.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let messages = self.messages.read().await;
        let mut due: Vec<_> = messages.values().filter(|m| m.is_due(now)).cloned().collect();
        due.sort_by_key(|m| m.scheduled_for);
        Ok(due)
    }

    async fn list_by_owner(&self, owner: &CredentialKey) -> Result<Vec<ScheduledMessage>> {
        let messages = self.messages.read().await;
        let mut owned: Vec<_> = messages
            .values()
            .filter(|m| m.workspace_id == owner.workspace_id && m.user_id == owner.user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.scheduled_for.cmp(&a.scheduled_for));
        Ok(owned)
    }
}
