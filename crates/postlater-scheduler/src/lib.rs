//! # Postlater Scheduler
//!
//! Delivery of scheduled messages at their due time.
//!
//! ## Design Principles
//! - Tokio timers only, nothing runs between ticks
//! - Status writes are compare-and-set, so overlapping ticks and immediate
//!   sends deliver each message at most once
//! - One live API client per (workspace, user), refreshed transparently
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval, every 60s)
//!   └── list_due(now) → DeliveryEngine::deliver (one task per message)
//!                         ├── pending → sending   (claim)
//!                         ├── ClientCache::resolve → refresh if expired
//!                         ├── MessagingClient::send_message
//!                         └── sending → sent | failed
//! ```

pub mod cache;
pub mod delivery;
pub mod engine;
pub mod service;

#[cfg(test)]
mod testing;

pub use cache::ClientCache;
pub use delivery::{CancelOutcome, DeliveryEngine};
pub use engine::Scheduler;
pub use service::MessageService;
