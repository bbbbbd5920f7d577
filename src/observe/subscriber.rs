//! A result set as registered with the channel router.

use super::processors::{process, ResolvedEvent};
use super::result_set::ObservableResultSet;
use super::strategy::Strategy;
use super::Delivery;
use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Subscriber {
    id: SubscriberId,
    channels: Vec<String>,
    strategy: Strategy,
    result_set: Arc<ObservableResultSet>,
    /// Events routed before the initial query finished. `None` once live.
    backlog: Mutex<Option<Vec<ResolvedEvent>>>,
}

impl Subscriber {
    pub fn new(
        id: SubscriberId,
        channels: Vec<String>,
        strategy: Strategy,
        result_set: Arc<ObservableResultSet>,
    ) -> Self {
        Self {
            id,
            channels,
            strategy,
            result_set,
            backlog: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn result_set(&self) -> &Arc<ObservableResultSet> {
        &self.result_set
    }

    pub fn collection(&self) -> &str {
        self.result_set.collection().name()
    }

    pub fn is_live(&self) -> bool {
        self.backlog.lock().is_none()
    }

    /// Process a routed event, or buffer it while initializing.
    ///
    /// Buffered events are replayed as queued deliveries.
    pub fn deliver(&self, event: ResolvedEvent, mode: Delivery) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if let Some(buffer) = backlog.as_mut() {
                buffer.push(event);
                return Ok(());
            }
        }
        process(&self.strategy, &self.result_set, &event, mode)
    }

    /// Replay buffered events in arrival order and go live.
    ///
    /// Events arriving during the replay are appended to the buffer and
    /// replayed in the same pass.
    pub fn finish_init(&self) -> Result<()> {
        let mut replayed = 0usize;
        loop {
            let batch = {
                let mut backlog = self.backlog.lock();
                match backlog.as_mut() {
                    Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
                    _ => {
                        *backlog = None;
                        break;
                    }
                }
            };
            for event in batch {
                replayed += 1;
                if let Err(e) = process(&self.strategy, &self.result_set, &event, Delivery::Queued) {
                    tracing::error!(
                        subscriber = %self.id,
                        id = %event.id,
                        error = %e,
                        "buffered event failed"
                    );
                }
            }
        }
        if replayed > 0 {
            tracing::debug!(subscriber = %self.id, replayed, "replayed buffered events");
        }
        Ok(())
    }

    /// Re-synchronize with the store. Skipped while still initializing.
    pub fn reload(&self) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        self.result_set.reload(Delivery::Queued)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("channels", &self.channels)
            .field("strategy", &self.strategy)
            .finish()
    }
}
