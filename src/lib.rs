//! keyplane — coordination core for a sharded, replicated key-value
//! store.
//!
//! The key space is split into 1024 slots; each slot is owned by exactly
//! one replica group at a time, and slots migrate live between groups
//! without losing availability. Routing any key to the correct group
//! requires a consistent cluster-wide view of the slot assignment, which
//! keyplane maintains with a raft-replicated metadata state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         keyplane                           │
//! ├────────────────────────────────────────────────────────────┤
//! │  Transport: raft RPC | coordination API      (src/server)  │
//! ├────────────────────────────────────────────────────────────┤
//! │  Coordinator: migration orchestration | key routing        │
//! │  Metadata store: groups map | slot array | barriers        │
//! ├────────────────────────────────────────────────────────────┤
//! │  Consensus: elections | replication | snapshots (src/raft) │
//! ├────────────────────────────────────────────────────────────┤
//! │  Groups: quorum writes | read-one | slot/key migration     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use keyplane::config::KeyplaneConfig;
//!
//! #[tokio::main]
//! async fn main() -> keyplane::Result<()> {
//!     // Single-node cluster that bootstraps itself.
//!     let config = KeyplaneConfig::development();
//!     keyplane::server::run(config).await
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod group;
pub mod raft;
pub mod server;
pub mod types;

// Re-exports
pub use error::{ErrorCategory, KeyplaneError, Result};
pub use types::*;
