//! In-process fakes for the remote API, plus a harness wiring them to
//! in-memory stores.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use postlater_core::error::{PostlaterError, Result};
use postlater_core::traits::{ApiConnector, CredentialStore, MessageStore, MessagingClient};
use postlater_core::types::{
    CredentialKey, CredentialRecord, MessagePatch, MessageStatus, NewMessage, ScheduledMessage,
    SentMessage, TokenGrant,
};
use postlater_store::{MemoryCredentialStore, MemoryMessageStore};

use crate::cache::ClientCache;
use crate::delivery::DeliveryEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub token: String,
    pub channel: String,
    pub text: String,
}

#[derive(Default)]
pub struct FakeApi {
    pub refresh_calls: AtomicUsize,
    pub connect_calls: AtomicUsize,
    pub fail_refresh: AtomicBool,
    send_error: Mutex<Option<String>>,
    hang_channel: Mutex<Option<String>>,
    connected: Mutex<Vec<String>>,
    sent: Mutex<Vec<SentRecord>>,
}

impl FakeApi {
    pub fn fail_sends_with(&self, code: &str) {
        *self.send_error.lock().unwrap() = Some(code.to_string());
    }

    /// Sends to `channel` never complete.
    pub fn hang_sends_to(&self, channel: &str) {
        *self.hang_channel.lock().unwrap() = Some(channel.to_string());
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn connected_tokens(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }
}

pub struct FakeConnector(pub Arc<FakeApi>);

#[async_trait]
impl ApiConnector for FakeConnector {
    async fn refresh_credential(&self, _refresh_token: &str) -> Result<TokenGrant> {
        let n = self.0.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        // Give colliding resolvers a chance to run.
        tokio::task::yield_now().await;
        if self.0.fail_refresh.load(Ordering::SeqCst) {
            return Err(PostlaterError::RefreshFailed("invalid_refresh_token".into()));
        }
        Ok(TokenGrant {
            access_token: format!("refreshed-{n}"),
            refresh_token: Some(format!("r-{n}")),
            expires_at: Some(Utc::now() + Duration::hours(12)),
        })
    }

    fn connect(&self, access_token: &str) -> Arc<dyn MessagingClient> {
        self.0.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.0.connected.lock().unwrap().push(access_token.to_string());
        Arc::new(FakeClient {
            token: access_token.to_string(),
            api: self.0.clone(),
        })
    }
}

struct FakeClient {
    token: String,
    api: Arc<FakeApi>,
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn send_message(&self, channel: &str, text: &str) -> Result<SentMessage> {
        tokio::task::yield_now().await;
        let hangs = self.api.hang_channel.lock().unwrap().as_deref() == Some(channel);
        if hangs {
            std::future::pending::<()>().await;
        }
        if let Some(code) = self.api.send_error.lock().unwrap().clone() {
            return Err(PostlaterError::remote(code));
        }
        let mut sent = self.api.sent.lock().unwrap();
        sent.push(SentRecord {
            token: self.token.clone(),
            channel: channel.to_string(),
            text: text.to_string(),
        });
        Ok(SentMessage {
            channel: channel.to_string(),
            remote_ts: format!("1700000000.{:06}", sent.len()),
        })
    }
}

/// Wraps the in-memory message store with switchable failures.
pub struct FaultyMessageStore {
    inner: Arc<MemoryMessageStore>,
    list_due_failures: AtomicUsize,
    failing_ids: Mutex<HashSet<String>>,
}

impl FaultyMessageStore {
    pub fn new(inner: Arc<MemoryMessageStore>) -> Self {
        Self {
            inner,
            list_due_failures: AtomicUsize::new(0),
            failing_ids: Mutex::new(HashSet::new()),
        }
    }

    /// The next `n` due queries fail.
    pub fn fail_next_list_due(&self, n: usize) {
        self.list_due_failures.store(n, Ordering::SeqCst);
    }

    /// Every write to message `id` fails.
    pub fn fail_updates_for(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    fn check_write(&self, id: &str) -> Result<()> {
        if self.failing_ids.lock().unwrap().contains(id) {
            return Err(PostlaterError::Store("database is locked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FaultyMessageStore {
    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        self.inner.get(id).await
    }

    async fn create(&self, message: ScheduledMessage) -> Result<ScheduledMessage> {
        self.inner.create(message).await
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<Option<ScheduledMessage>> {
        self.check_write(id)?;
        self.inner.update(id, patch).await
    }

    async fn update_if_status(
        &self,
        id: &str,
        expected: MessageStatus,
        patch: MessagePatch,
    ) -> Result<Option<ScheduledMessage>> {
        self.check_write(id)?;
        self.inner.update_if_status(id, expected, patch).await
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let fail = self
            .list_due_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(PostlaterError::Store("database is locked".into()));
        }
        self.inner.list_due(now).await
    }

    async fn list_by_owner(&self, owner: &CredentialKey) -> Result<Vec<ScheduledMessage>> {
        self.inner.list_by_owner(owner).await
    }
}

pub struct Harness {
    pub key: CredentialKey,
    pub credentials: Arc<MemoryCredentialStore>,
    pub messages: Arc<MemoryMessageStore>,
    pub api: Arc<FakeApi>,
    pub cache: Arc<ClientCache>,
    pub delivery: Arc<DeliveryEngine>,
}

impl Harness {
    pub fn new() -> Self {
        let credentials = Arc::new(MemoryCredentialStore::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let api = Arc::new(FakeApi::default());
        let cache = Arc::new(ClientCache::new(
            credentials.clone(),
            Arc::new(FakeConnector(api.clone())),
        ));
        let delivery = Arc::new(DeliveryEngine::new(messages.clone(), cache.clone()));
        Self {
            key: CredentialKey::new("T1", "U1"),
            credentials,
            messages,
            api,
            cache,
            delivery,
        }
    }

    pub fn credentials(&self) -> &MemoryCredentialStore {
        &self.credentials
    }

    pub async fn connect_valid(&self, token: &str) {
        let record = CredentialRecord::new(&self.key, token)
            .with_refresh("r-0", Utc::now() + Duration::hours(1));
        self.credentials.upsert(record).await.unwrap();
    }

    pub async fn connect_expired(&self, token: &str, refresh_token: Option<&str>) {
        let mut record = CredentialRecord::new(&self.key, token);
        record.refresh_token = refresh_token.map(str::to_string);
        record.expires_at = Some(Utc::now() - Duration::minutes(5));
        self.credentials.upsert(record).await.unwrap();
    }

    pub async fn stored_credential(&self) -> Option<CredentialRecord> {
        self.credentials.get(&self.key).await.unwrap()
    }

    /// Store a pending message for `key`, bypassing the future-time check.
    pub async fn schedule_for(&self, key: &CredentialKey, at: DateTime<Utc>) -> ScheduledMessage {
        self.insert(key, "C42", at).await
    }

    pub async fn schedule_to(&self, channel: &str, at: DateTime<Utc>) -> ScheduledMessage {
        let key = self.key.clone();
        self.insert(&key, channel, at).await
    }

    async fn insert(&self, key: &CredentialKey, channel: &str, at: DateTime<Utc>) -> ScheduledMessage {
        let message = NewMessage {
            workspace_id: key.workspace_id.clone(),
            user_id: key.user_id.clone(),
            channel_id: channel.into(),
            channel_name: Some("general".into()),
            content: "ship it".into(),
            scheduled_for: at,
            timezone: "Asia/Tokyo".into(),
        }
        .into_message(Utc::now());
        self.messages.create(message).await.unwrap()
    }

    pub async fn schedule(&self, at: DateTime<Utc>) -> ScheduledMessage {
        let key = self.key.clone();
        self.schedule_for(&key, at).await
    }

    pub async fn message(&self, id: &str) -> ScheduledMessage {
        self.messages.get(id).await.unwrap().unwrap()
    }
}
