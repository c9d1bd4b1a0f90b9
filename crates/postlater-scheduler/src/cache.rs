//! Authenticated client cache: one live API client per (workspace, user).
//!
//! Cache hits are returned as is. Freshness is checked only when a client is
//! built: an expired credential is refreshed first, persisted, and the new
//! access token is what the cached client carries.
//!
//! Resolution for one key is serialised by a per-key async mutex. A resolver
//! that waited on the lock re-checks the cache and re-reads the credential, so
//! two colliding resolutions (immediate send + scheduler tick) perform at most
//! one remote refresh between them.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use postlater_core::error::{PostlaterError, Result};
use postlater_core::traits::{ApiConnector, CredentialStore, MessagingClient};
use postlater_core::types::{CredentialKey, CredentialPatch, CredentialRecord};

pub struct ClientCache {
    credentials: Arc<dyn CredentialStore>,
    connector: Arc<dyn ApiConnector>,
    clients: RwLock<HashMap<CredentialKey, Arc<dyn MessagingClient>>>,
    key_locks: std::sync::Mutex<HashMap<CredentialKey, Arc<Mutex<()>>>>,
}

impl ClientCache {
    pub fn new(credentials: Arc<dyn CredentialStore>, connector: Arc<dyn ApiConnector>) -> Self {
        Self {
            credentials,
            connector,
            clients: RwLock::new(HashMap::new()),
            key_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a live client, or `None` when the pair cannot be authenticated.
    pub async fn resolve_client(&self, key: &CredentialKey) -> Option<Arc<dyn MessagingClient>> {
        match self.try_resolve_client(key).await {
            Ok(client) => Some(client),
            Err(e @ PostlaterError::CredentialMissing(_)) => {
                tracing::debug!(%key, "no usable credential: {e}");
                None
            }
            Err(e) => {
                tracing::warn!(%key, "client resolution failed: {e}");
                None
            }
        }
    }

    /// Like [`resolve_client`](Self::resolve_client), keeping the reason.
    /// Errors are `CredentialMissing`, `RefreshFailed`, or `Store`.
    pub async fn try_resolve_client(&self, key: &CredentialKey) -> Result<Arc<dyn MessagingClient>> {
        if let Some(client) = self.cached(key).await {
            return Ok(client);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        // Populated while we waited on the lock.
        if let Some(client) = self.cached(key).await {
            return Ok(client);
        }

        let record = self
            .credentials
            .get(key)
            .await?
            .ok_or_else(|| PostlaterError::CredentialMissing(format!("no credentials for {key}")))?;

        let record = if record.is_expired(Utc::now()) {
            let Some(refresh_token) = record.refresh_token.as_deref() else {
                return Err(PostlaterError::CredentialMissing(format!(
                    "access token for {key} expired and no refresh token is stored"
                )));
            };
            self.refresh(key, refresh_token).await?
        } else {
            record
        };

        let client = self.connector.connect(&record.access_token);
        self.clients.write().await.insert(key.clone(), client.clone());
        tracing::debug!(%key, token = %record.redacted_token(), "client cached");
        Ok(client)
    }

    /// Evict the cached client for a key. The credential store is not touched.
    /// The key's lock is dropped too unless another resolver is waiting on it.
    pub async fn invalidate(&self, key: &CredentialKey) -> bool {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let removed = self.clients.write().await.remove(key).is_some();
        if removed {
            tracing::debug!(%key, "client evicted");
        }
        self.release_key_lock(key, &lock);
        removed
    }

    pub async fn cached_len(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn cached(&self, key: &CredentialKey) -> Option<Arc<dyn MessagingClient>> {
        self.clients.read().await.get(key).cloned()
    }

    fn key_lock(&self, key: &CredentialKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Remove the key's lock when the map and `held` are its only owners.
    fn release_key_lock(&self, key: &CredentialKey, held: &Arc<Mutex<()>>) {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry, held) && Arc::strong_count(held) == 2)
        {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        self.key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Exchange the refresh token and persist the result. Caller holds the key lock.
    /// On failure the stored credential is left untouched.
    async fn refresh(&self, key: &CredentialKey, refresh_token: &str) -> Result<CredentialRecord> {
        tracing::info!(%key, "access token expired, refreshing");

        let grant = self
            .connector
            .refresh_credential(refresh_token)
            .await
            .map_err(|e| match e {
                PostlaterError::RefreshFailed(_) => e,
                other => PostlaterError::RefreshFailed(other.to_string()),
            })?;

        let updated = self
            .credentials
            .update(key, CredentialPatch::from(grant))
            .await?
            .ok_or_else(|| {
                PostlaterError::CredentialMissing(format!("credentials for {key} removed during refresh"))
            })?;

        self.clients.write().await.remove(key);
        tracing::info!(%key, token = %updated.redacted_token(), "access token refreshed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_cache_hit_reuses_client() {
        let h = Harness::new();
        h.connect_valid("xoxp-1").await;

        let first = h.cache.resolve_client(&h.key).await.unwrap();
        let second = h.cache.resolve_client(&h.key).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.api.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.cached_len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_credential_is_absent() {
        let h = Harness::new();
        assert!(h.cache.resolve_client(&h.key).await.is_none());
        assert!(matches!(
            h.cache.try_resolve_client(&h.key).await,
            Err(PostlaterError::CredentialMissing(_))
        ));
        assert_eq!(h.cache.cached_len().await, 0);
    }

    #[tokio::test]
    async fn test_expired_credential_is_refreshed() {
        let h = Harness::new();
        h.connect_expired("xoxp-old", Some("r-old")).await;

        let client = h.cache.resolve_client(&h.key).await;
        assert!(client.is_some());

        let stored = h.stored_credential().await.unwrap();
        assert_ne!(stored.access_token, "xoxp-old");
        assert_eq!(stored.access_token, "refreshed-1");
        assert_eq!(stored.refresh_token.as_deref(), Some("r-1"));
        assert!(!stored.is_expired(Utc::now()));
        assert_eq!(h.api.connected_tokens(), vec!["refreshed-1".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_absent_and_untouched() {
        let h = Harness::new();
        h.connect_expired("xoxp-old", None).await;
        let before = h.stored_credential().await.unwrap();

        assert!(h.cache.resolve_client(&h.key).await.is_none());

        assert_eq!(h.stored_credential().await.unwrap(), before);
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_credential_untouched() {
        let h = Harness::new();
        h.connect_expired("xoxp-old", Some("r-old")).await;
        h.api.fail_refresh.store(true, Ordering::SeqCst);
        let before = h.stored_credential().await.unwrap();

        assert!(matches!(
            h.cache.try_resolve_client(&h.key).await,
            Err(PostlaterError::RefreshFailed(_))
        ));
        assert!(h.cache.resolve_client(&h.key).await.is_none());
        assert_eq!(h.stored_credential().await.unwrap(), before);

        // Fixed out of band: the next resolution succeeds.
        h.api.fail_refresh.store(false, Ordering::SeqCst);
        assert!(h.cache.resolve_client(&h.key).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_resolution_refreshes_once() {
        let h = Harness::new();
        h.connect_expired("xoxp-old", Some("r-old")).await;

        let (a, b, c) = tokio::join!(
            h.cache.resolve_client(&h.key),
            h.cache.resolve_client(&h.key),
            h.cache.resolve_client(&h.key),
        );

        assert!(a.is_some() && b.is_some() && c.is_some());
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.api.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let h = Harness::new();
        h.connect_valid("xoxp-1").await;
        h.cache.resolve_client(&h.key).await.unwrap();

        assert!(h.cache.invalidate(&h.key).await);
        assert!(!h.cache.invalidate(&h.key).await);
        assert!(h.stored_credential().await.is_some());

        h.cache.resolve_client(&h.key).await.unwrap();
        assert_eq!(h.api.connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_drops_idle_key_lock() {
        let h = Harness::new();
        h.connect_valid("xoxp-1").await;
        h.cache.resolve_client(&h.key).await.unwrap();
        assert_eq!(h.cache.key_lock_count(), 1);

        h.cache.invalidate(&h.key).await;
        assert_eq!(h.cache.key_lock_count(), 0);

        // Invalidating an unknown key leaves nothing behind either.
        h.cache.invalidate(&CredentialKey::new("T9", "U9")).await;
        assert_eq!(h.cache.key_lock_count(), 0);

        assert!(h.cache.resolve_client(&h.key).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_keeps_lock_another_resolver_holds() {
        let h = Harness::new();
        h.connect_valid("xoxp-1").await;
        h.cache.resolve_client(&h.key).await.unwrap();
        let waiting = h.cache.key_lock(&h.key);

        assert!(h.cache.invalidate(&h.key).await);
        assert_eq!(h.cache.key_lock_count(), 1);

        drop(waiting);
        h.cache.invalidate(&h.key).await;
        assert_eq!(h.cache.key_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_freshness_check() {
        let h = Harness::new();
        h.connect_valid("xoxp-1").await;
        h.cache.resolve_client(&h.key).await.unwrap();

        // Expire the stored credential behind the cache's back.
        h.credentials()
            .update(
                &h.key,
                CredentialPatch {
                    expires_at: Some(Some(Utc::now() - Duration::minutes(1))),
                    refresh_token: Some(Some("r-x".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.cache.resolve_client(&h.key).await.unwrap();
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);
    }
}
