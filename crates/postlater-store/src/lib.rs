//! # Postlater Store
//!
//! Implementations of [`CredentialStore`](postlater_core::CredentialStore) and
//! [`MessageStore`](postlater_core::MessageStore).
//!
//! - [`MemoryCredentialStore`] / [`MemoryMessageStore`]: `tokio` locks around
//!   hash maps, for tests and throwaway runs.
//! - [`SqliteStore`]: one `rusqlite` connection behind a mutex, survives restarts.
//!
//! Both make every per-key or per-id write atomic, which is what the
//! delivery guard (`pending → sending`, first writer wins) relies on.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCredentialStore, MemoryMessageStore};
pub use sqlite::SqliteStore;
