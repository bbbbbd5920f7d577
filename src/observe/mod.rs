//! Live result sets and their observers.
//!
//! An [`ObservableResultSet`] tracks which documents satisfy one query; its
//! [`ResultSetMultiplexer`] serializes the resulting add/change/remove events
//! and fans them out to every attached [`ObserveHandle`]. A [`Subscriber`]
//! registers the pair with the channel router under the channel topology
//! chosen by [`Strategy`].

pub mod multiplexer;
pub mod processors;
pub mod result_set;
pub mod strategy;
pub mod subscriber;

pub use multiplexer::{
    ChangeKind, FetchFallback, HandleId, ObserveCallbacks, ObserveHandle, ResultSetMultiplexer,
};
pub use processors::ResolvedEvent;
pub use result_set::{reconcile, ObservableResultSet, Reconciliation};
pub use strategy::Strategy;
pub use subscriber::{Subscriber, SubscriberId};

/// How an event reaches a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Run now and wait: the writer's own observers see its write before
    /// the write call returns. Errors go back to the caller.
    Immediate,
    /// Enqueue behind pending work. Errors are logged and recorded.
    Queued,
}
