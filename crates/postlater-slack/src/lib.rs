//! # Postlater Slack
//!
//! Remote API boundary for Slack workspaces.
//! - [`SlackConnector`]: refreshes rotating user tokens and builds clients.
//! - [`SlackClient`]: posts messages with one access token.

pub mod slack;

pub use slack::{SlackClient, SlackConnector};
