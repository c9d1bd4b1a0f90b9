//! Slack Web API: `oauth.v2.access` refresh exchange and `chat.postMessage`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postlater_core::config::SlackConfig;
use postlater_core::error::{PostlaterError, Result};
use postlater_core::traits::{ApiConnector, MessagingClient};
use postlater_core::types::{SentMessage, TokenGrant, expiry_after};
use serde::Deserialize;
use std::sync::Arc;

/// Builds Slack clients and refreshes expiring user tokens.
pub struct SlackConnector {
    config: SlackConfig,
    http: reqwest::Client,
}

impl SlackConnector {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.config.api_base, method)
    }
}

#[async_trait]
impl ApiConnector for SlackConnector {
    async fn refresh_credential(&self, refresh_token: &str) -> Result<TokenGrant> {
        if self.config.client_id.is_empty() || self.config.client_secret.is_empty() {
            return Err(PostlaterError::RefreshFailed(
                "slack client_id/client_secret not configured".into(),
            ));
        }

        let response = self
            .http
            .post(self.api_url("oauth.v2.access"))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| PostlaterError::RefreshFailed(format!("oauth.v2.access failed: {e}")))?;

        let body: OAuthResponse = response
            .json()
            .await
            .map_err(|e| PostlaterError::RefreshFailed(format!("Invalid oauth response: {e}")))?;

        body.into_grant(Utc::now())
    }

    fn connect(&self, access_token: &str) -> Arc<dyn MessagingClient> {
        Arc::new(SlackClient {
            http: self.http.clone(),
            api_base: self.config.api_base.clone(),
            token: access_token.to_string(),
        })
    }
}

/// A Slack Web API client bound to one access token.
pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

#[async_trait]
impl MessagingClient for SlackClient {
    async fn send_message(&self, channel: &str, text: &str) -> Result<SentMessage> {
        let body = serde_json::json!({
            "channel": channel,
            "text": text,
        });

        let response = self
            .http
            .post(api_url(&self.api_base, "chat.postMessage"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PostlaterError::Http(format!("chat.postMessage failed: {e}")))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("?");
            tracing::warn!("Slack rate limited chat.postMessage (retry after {retry_after}s)");
            return Err(PostlaterError::remote("ratelimited"));
        }

        let result: PostMessageResponse = response
            .json()
            .await
            .map_err(|e| PostlaterError::Http(format!("Invalid chat.postMessage response: {e}")))?;

        result.into_sent(channel)
    }
}

fn api_url(base: &str, method: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), method)
}

// --- Slack API Types ---

#[derive(Debug, Deserialize)]
pub struct OAuthResponse {
    pub ok: bool,
    pub error: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    /// User-token installs nest the rotated user token here.
    pub authed_user: Option<AuthedUser>,
}

#[derive(Debug, Deserialize)]
pub struct AuthedUser {
    pub id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

impl OAuthResponse {
    pub fn into_grant(self, now: DateTime<Utc>) -> Result<TokenGrant> {
        if !self.ok {
            return Err(PostlaterError::RefreshFailed(
                self.error.unwrap_or_else(|| "unknown_error".into()),
            ));
        }

        let (access_token, refresh_token, expires_in) = match self.access_token {
            Some(token) => (token, self.refresh_token, self.expires_in),
            None => {
                let user = self.authed_user.ok_or_else(|| {
                    PostlaterError::RefreshFailed("response carried no access token".into())
                })?;
                let token = user.access_token.ok_or_else(|| {
                    PostlaterError::RefreshFailed("response carried no access token".into())
                })?;
                (token, user.refresh_token, user.expires_in)
            }
        };

        let expires_at = match expires_in {
            Some(secs) => Some(expiry_after(now, secs).ok_or_else(|| {
                PostlaterError::RefreshFailed(format!("invalid expires_in: {secs}"))
            })?),
            None => None,
        };

        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PostMessageResponse {
    pub ok: bool,
    pub error: Option<String>,
    pub channel: Option<String>,
    pub ts: Option<String>,
}

impl PostMessageResponse {
    pub fn into_sent(self, requested_channel: &str) -> Result<SentMessage> {
        if !self.ok {
            return Err(PostlaterError::remote(
                self.error.unwrap_or_else(|| "unknown_error".into()),
            ));
        }
        let remote_ts = self
            .ts
            .ok_or_else(|| PostlaterError::Http("chat.postMessage response has no ts".into()))?;
        Ok(SentMessage {
            channel: self.channel.unwrap_or_else(|| requested_channel.to_string()),
            remote_ts,
        })
    }
}
