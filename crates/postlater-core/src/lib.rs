//! # Postlater Core
//!
//! Shared vocabulary for the message-delivery subsystem: the data model,
//! the status state machine, collaborator traits and the error taxonomy.
//!
//! ```text
//! Scheduler loop ──► MessageStore (due query)
//!        │
//!        ▼
//! DeliveryEngine ──► ClientCache ──► CredentialStore (read / refresh)
//!        │                 │
//!        │                 └──► ApiConnector (refresh, connect)
//!        ▼
//! MessagingClient::send_message ──► MessageStore (status update)
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::PostlaterConfig;
pub use error::{PostlaterError, Result};
pub use traits::{ApiConnector, CredentialStore, MessageStore, MessagingClient};
pub use types::{
    CredentialKey, CredentialPatch, CredentialRecord, MessagePatch, MessageStatus, NewMessage,
    ScheduledMessage, SentMessage, TokenGrant,
};
