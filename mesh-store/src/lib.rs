//! Mesh Store - persistence for the context mesh and the decision audit log.
//!
//! Every consumer talks to a [`DurableStore`]. Three implementations ship here:
//!
//! - **[`MemoryStore`]**: fast ephemeral tier, also the fake store in tests
//! - **[`SqliteStore`]**: transactional tier on SQLite
//! - **[`TieredStore`]**: the local persistence path used when the durable
//!   store is unreachable (ephemeral first, transactional on rejection)
//!
//! ```text
//!   publish ──► durable store ──(unreachable)──► TieredStore
//!                                                 ├─ MemoryStore
//!                                                 └─ SqliteStore
//! ```

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod tiered;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::DurableStore;
pub use tiered::TieredStore;
pub use types::*;
