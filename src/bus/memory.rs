//! In-process bus delivering messages synchronously on the publishing thread.
//!
//! Several registries can share one bus to stand in for separate processes.
//! Delivery can be held back and then released or discarded, which lets
//! tests reorder or lose messages on purpose.

use super::{MessageBus, MessageHandler, SubscriptionToken};
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct InMemoryBus {
    handlers: Mutex<HashMap<String, Vec<(SubscriptionToken, MessageHandler)>>>,
    next_token: AtomicU64,
    held: Mutex<Option<Vec<(String, Vec<u8>)>>>,
    log: Mutex<Vec<(String, Vec<u8>)>>,
    unsubscribes: Mutex<HashMap<String, usize>>,
    fail_publish: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue published messages instead of delivering them.
    pub fn hold(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Deliver every held message in publish order and resume delivery.
    pub fn release(&self) {
        let pending = self.held.lock().take().unwrap_or_default();
        for (channel, payload) in pending {
            self.deliver(&channel, &payload);
        }
    }

    /// Drop every held message and resume delivery. Returns how many were lost.
    pub fn discard_held(&self) -> usize {
        self.held.lock().take().map(|v| v.len()).unwrap_or(0)
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Every message published so far.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.log.lock().clone()
    }

    pub fn published_on(&self, channel: &str) -> usize {
        self.log.lock().iter().filter(|(c, _)| c == channel).count()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.handlers.lock().get(channel).map(Vec::len).unwrap_or(0)
    }

    /// How many times a handler was removed from `channel`.
    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.unsubscribes.lock().get(channel).copied().unwrap_or(0)
    }

    fn deliver(&self, channel: &str, payload: &[u8]) {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<MessageHandler> = self
            .handlers
            .lock()
            .get(channel)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(channel, payload);
        }
    }
}

impl MessageBus for InMemoryBus {
    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<SubscriptionToken> {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((token, handler));
        Ok(token)
    }

    fn unsubscribe(&self, channel: &str, token: SubscriptionToken) -> Result<()> {
        let mut handlers = self.handlers.lock();
        let list = handlers
            .get_mut(channel)
            .ok_or_else(|| SyncError::Bus(format!("no subscription on {}", channel)))?;
        let before = list.len();
        list.retain(|(t, _)| *t != token);
        if list.len() == before {
            return Err(SyncError::Bus(format!("unknown token on {}", channel)));
        }
        if list.is_empty() {
            handlers.remove(channel);
        }
        *self.unsubscribes.lock().entry(channel.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SyncError::Bus("injected publish failure".to_string()));
        }
        self.log.lock().push((channel.to_string(), payload.to_vec()));
        {
            let mut held = self.held.lock();
            if let Some(queue) = held.as_mut() {
                queue.push((channel.to_string(), payload.to_vec()));
                return Ok(());
            }
        }
        self.deliver(channel, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, MessageHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |channel: &str, payload: &[u8]| {
            sink.lock()
                .push(format!("{}:{}", channel, String::from_utf8_lossy(payload)));
        });
        (seen, handler)
    }

    #[test]
    fn test_publish_reaches_subscribers() {
        let bus = InMemoryBus::new();
        let (seen, handler) = recorder();
        bus.subscribe("c", handler).unwrap();
        bus.publish("c", b"one").unwrap();
        bus.publish("other", b"two").unwrap();
        assert_eq!(*seen.lock(), vec!["c:one"]);
        assert_eq!(bus.published().len(), 2);
    }

    #[test]
    fn test_unsubscribe_by_token() {
        let bus = InMemoryBus::new();
        let (seen, handler) = recorder();
        let token = bus.subscribe("c", handler).unwrap();
        bus.unsubscribe("c", token).unwrap();
        bus.publish("c", b"x").unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(bus.unsubscribe_count("c"), 1);
        assert!(bus.unsubscribe("c", token).is_err());
    }

    #[test]
    fn test_hold_release_discard() {
        let bus = InMemoryBus::new();
        let (seen, handler) = recorder();
        bus.subscribe("c", handler).unwrap();

        bus.hold();
        bus.publish("c", b"1").unwrap();
        bus.publish("c", b"2").unwrap();
        assert!(seen.lock().is_empty());
        bus.release();
        assert_eq!(*seen.lock(), vec!["c:1", "c:2"]);

        bus.hold();
        bus.publish("c", b"lost").unwrap();
        assert_eq!(bus.discard_held(), 1);
        assert_eq!(seen.lock().len(), 2);
    }
}
