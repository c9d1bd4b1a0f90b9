//! Process-wide context: stores, client cache, delivery engine and scheduler
//! in one owned object.

use chrono::Utc;
use std::sync::Arc;

use postlater_core::config::SchedulerConfig;
use postlater_core::error::Result;
use postlater_core::traits::{ApiConnector, CredentialStore, MessageStore};
use postlater_core::types::{CredentialKey, CredentialRecord, NewMessage, ScheduledMessage};

use crate::cache::ClientCache;
use crate::delivery::{CancelOutcome, DeliveryEngine};
use crate::engine::Scheduler;

pub struct MessageService {
    credentials: Arc<dyn CredentialStore>,
    messages: Arc<dyn MessageStore>,
    clients: Arc<ClientCache>,
    delivery: Arc<DeliveryEngine>,
    scheduler: Scheduler,
}

impl MessageService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        messages: Arc<dyn MessageStore>,
        connector: Arc<dyn ApiConnector>,
        config: &SchedulerConfig,
    ) -> Self {
        let clients = Arc::new(ClientCache::new(credentials.clone(), connector));
        let delivery = Arc::new(DeliveryEngine::new(messages.clone(), clients.clone()));
        let scheduler = Scheduler::new(messages.clone(), delivery.clone(), config);
        Self {
            credentials,
            messages,
            clients,
            delivery,
            scheduler,
        }
    }

    /// Validate and store a new pending message.
    pub async fn schedule(&self, new: NewMessage) -> Result<ScheduledMessage> {
        let now = Utc::now();
        new.validate(now)?;
        let message = self.messages.create(new.into_message(now)).await?;
        tracing::info!(
            message_id = %message.id,
            workspace_id = %message.workspace_id,
            user_id = %message.user_id,
            "scheduled for {}",
            message.local_scheduled_time()
        );
        Ok(message)
    }

    pub async fn deliver_now(&self, message_id: &str) -> Result<Option<ScheduledMessage>> {
        self.delivery.deliver_now(message_id).await
    }

    pub async fn cancel(&self, message_id: &str) -> Result<CancelOutcome> {
        self.delivery.cancel(message_id).await
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<ScheduledMessage>> {
        self.messages.get(message_id).await
    }

    pub async fn list_for_owner(&self, owner: &CredentialKey) -> Result<Vec<ScheduledMessage>> {
        self.messages.list_by_owner(owner).await
    }

    /// Store credentials obtained out of band. A cached client for the key is dropped.
    pub async fn connect(&self, record: CredentialRecord) -> Result<CredentialRecord> {
        let key = record.key();
        let stored = self.credentials.upsert(record).await?;
        self.clients.invalidate(&key).await;
        tracing::info!(%key, token = %stored.redacted_token(), "workspace connected");
        Ok(stored)
    }

    /// Forget the credentials for a key. Returns whether any were stored.
    pub async fn disconnect(&self, key: &CredentialKey) -> Result<bool> {
        let removed = self.credentials.delete(key).await?;
        self.clients.invalidate(key).await;
        if removed {
            tracing::info!(%key, "workspace disconnected");
        }
        Ok(removed)
    }

    pub fn start_scheduler(&self) -> bool {
        self.scheduler.start()
    }

    pub fn stop_scheduler(&self) -> bool {
        self.scheduler.stop()
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// One scheduler pass outside the loop.
    pub async fn tick(&self) -> usize {
        self.scheduler.tick().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
