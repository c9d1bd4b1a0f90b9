//! Data model: credentials, scheduled messages and the delivery state machine.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PostlaterError, Result};

/// Longest message body accepted at creation time, in characters.
pub const MAX_CONTENT_LEN: usize = 4000;

/// Identifies one connected (workspace, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialKey {
    pub workspace_id: String,
    pub user_id: String,
}

impl CredentialKey {
    pub fn new(workspace_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.user_id)
    }
}

// ─── Credentials ──────────────────────────────────────────────

/// Access/refresh credentials for one (workspace, user) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub workspace_id: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token`. `None` means it does not expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(key: &CredentialKey, access_token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workspace_id: key.workspace_id.clone(),
            user_id: key.user_id.clone(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_refresh(mut self, refresh_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self.expires_at = Some(expires_at);
        self
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(&self.workspace_id, &self.user_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Token prefix safe for logs.
    pub fn redacted_token(&self) -> String {
        let prefix: String = self.access_token.chars().take(8).collect();
        format!("{prefix}…")
    }
}

/// Partial credential update. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<Option<String>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl CredentialPatch {
    pub fn apply(self, record: &mut CredentialRecord, now: DateTime<Utc>) {
        if let Some(token) = self.access_token {
            record.access_token = token;
        }
        if let Some(refresh) = self.refresh_token {
            record.refresh_token = refresh;
        }
        if let Some(expires) = self.expires_at {
            record.expires_at = expires;
        }
        record.updated_at = now;
    }
}

/// Result of a refresh exchange with the remote authorization endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Rotated refresh token, if the provider issued one.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// `now + secs`, or `None` when the lifetime is out of range.
pub fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(secs).and_then(|lifetime| now.checked_add_signed(lifetime))
}

impl From<TokenGrant> for CredentialPatch {
    /// The old refresh token survives when the grant carries none. A grant without
    /// an expiry yields a non-expiring token, so the stale expiry is cleared.
    fn from(grant: TokenGrant) -> Self {
        Self {
            access_token: Some(grant.access_token),
            refresh_token: grant.refresh_token.map(Some),
            expires_at: Some(grant.expires_at),
        }
    }
}

// ─── Messages ──────────────────────────────────────────────

/// Delivery lifecycle of a scheduled message.
///
/// ```text
/// pending ──► sending ──► sent
///    │           └──────► failed
///    └──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sending) | (Sending, Sent) | (Sending, Failed) | (Pending, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = PostlaterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PostlaterError::Store(format!("unknown message status '{other}'"))),
        }
    }
}

/// A message waiting for, undergoing or done with delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub content: String,
    /// Absolute delivery instant. Drives the due query.
    pub scheduled_for: DateTime<Utc>,
    /// IANA zone the user picked. Informational only.
    pub timezone: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ScheduledMessage {
    pub fn owner(&self) -> CredentialKey {
        CredentialKey::new(&self.workspace_id, &self.user_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending && self.scheduled_for <= now
    }

    /// `scheduled_for` rendered in the message's own timezone, falling back to UTC.
    pub fn local_scheduled_time(&self) -> String {
        match self.timezone.parse::<Tz>() {
            Ok(tz) => self
                .scheduled_for
                .with_timezone(&tz)
                .format("%Y-%m-%d %H:%M %Z")
                .to_string(),
            Err(_) => self.scheduled_for.format("%Y-%m-%d %H:%M UTC").to_string(),
        }
    }
}

/// Partial message update. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub channel_name: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MessageStatus::Sent),
            sent_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(MessageStatus::Failed),
            error_message: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn apply(self, message: &mut ScheduledMessage) {
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(name) = self.channel_name {
            message.channel_name = Some(name);
        }
        if let Some(at) = self.sent_at {
            message.sent_at = Some(at);
        }
        if let Some(reason) = self.error_message {
            message.error_message = Some(reason);
        }
    }
}

/// Input for scheduling a new message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub workspace_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub content: String,
    pub scheduled_for: DateTime<Utc>,
    pub timezone: String,
}

impl NewMessage {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.channel_id.trim().is_empty() {
            return Err(PostlaterError::InvalidMessage("channel is required".into()));
        }
        if self.content.trim().is_empty() {
            return Err(PostlaterError::InvalidMessage("content is empty".into()));
        }
        let len = self.content.chars().count();
        if len > MAX_CONTENT_LEN {
            return Err(PostlaterError::InvalidMessage(format!(
                "content is {len} characters, limit is {MAX_CONTENT_LEN}"
            )));
        }
        if self.scheduled_for <= now {
            return Err(PostlaterError::InvalidMessage(
                "scheduled time must be in the future".into(),
            ));
        }
        if self.timezone.parse::<Tz>().is_err() {
            return Err(PostlaterError::InvalidMessage(format!(
                "unknown timezone '{}'",
                self.timezone
            )));
        }
        Ok(())
    }

    /// Build the pending record. Call `validate` first.
    pub fn into_message(self, now: DateTime<Utc>) -> ScheduledMessage {
        ScheduledMessage {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: self.workspace_id,
            user_id: self.user_id,
            channel_id: self.channel_id,
            channel_name: self.channel_name,
            content: self.content,
            scheduled_for: self.scheduled_for,
            timezone: self.timezone,
            status: MessageStatus::Pending,
            created_at: now,
            sent_at: None,
            error_message: None,
        }
    }
}

/// Remote acknowledgement of a posted message.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel: String,
    /// Remote message timestamp, which doubles as its id.
    pub remote_ts: String,
}
