//! Context Mesh - shared situational awareness for harbor operations modules.
//!
//! Modules publish [`ContextMessage`]s (mission, risk, AI, prediction and
//! telemetry context) and subscribe to the types they care about.
//!
//! ```text
//!   publish(msg)
//!     │
//!     ├─► handler 1 ─► handler 2 ─► ...      (synchronous, in subscription order)
//!     │
//!     └─► persistence worker ──► durable store        (remote mode, synced)
//!                │                └─► local tiers     (local mode, pending)
//!                └─(failure)──► retry queue ──(timer)──┘
//! ```
//!
//! Delivery to handlers never waits on storage. A faulting handler is logged
//! and reported in the [`PublishReceipt`]; later handlers still run.

pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
mod registry;
mod retry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MeshConfig;
pub use error::{HandlerError, MeshError, Result};
pub use mesh::{ContextMesh, RetryReport};
pub use types::{
    ContextHandler, ContextMessage, ContextSubscription, HandlerFault, MeshMode, PublishReceipt,
    SubscriptionId,
};

pub use mesh_store::{ContextType, SyncStatus};
