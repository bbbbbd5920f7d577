//! # livesync
//!
//! Live query synchronization over a document cache and a pub/sub change bus.
//!
//! ## Core Concepts
//!
//! - **Result sets**: the live answer to one query, shared by every observer
//!   of an identical query and kept current from change events
//! - **Multiplexers**: ordered fan-out of a result set's add/change/remove
//!   events to its observers
//! - **Channels**: collection-wide, per-document or custom bus channels,
//!   chosen per query shape
//! - **Optimistic writes**: a process applies its own writes to local
//!   observers before they round-trip through the bus
//! - **Race correction**: conflicting writes within a short window trigger
//!   an authoritative re-read broadcast as a forced update
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{InMemoryBus, MemoryStore, ObserveCallbacks, QueryOptions, SyncConfig, SyncRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let registry = SyncRegistry::new(SyncConfig::default(), Arc::new(InMemoryBus::new()))?;
//! let tasks = registry.collection("tasks", Arc::new(MemoryStore::new()));
//!
//! let handle = tasks.observe(
//!     json!({"done": false}),
//!     QueryOptions::new(),
//!     ObserveCallbacks::new().on_added(|id, doc| println!("added {} {:?}", id, doc)),
//! )?;
//!
//! if let Some(doc) = livesync::document(json!({"title": "write docs", "done": false})) {
//!     tasks.insert(doc)?;
//! }
//! handle.stop();
//! ```

pub mod bus;
pub mod cache;
pub mod collection;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod mutation;
pub mod observe;
pub mod query;
pub mod queue;
pub mod race;
pub mod registry;
pub mod router;
pub mod store;
pub mod timer;
pub mod types;

// Re-exports
pub use bus::{ChannelNames, InMemoryBus, MessageBus, MessageHandler, SubscriptionToken, WireCodec, WireFormat};
pub use cache::{CacheStats, DocumentCache};
pub use collection::{Collection, CollectionContext};
pub use config::{MutationDefaults, RaceDetectionConfig, SyncConfig};
pub use diff::{top_level_diff, FieldDiff};
pub use error::{Result, SyncError};
pub use events::{EventKind, MutationEvent};
pub use mutation::MutationOptions;
pub use observe::{Delivery, ObserveCallbacks, ObserveHandle, Reconciliation, Strategy};
pub use query::{Projection, QueryOptions, SortKey, SortOrder};
pub use race::RaceDetector;
pub use registry::SyncRegistry;
pub use router::ChannelRouter;
pub use store::{DocumentStore, MemoryStore, UpsertOutcome};
pub use types::*;
