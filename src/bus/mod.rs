//! Publish/subscribe bus interface and channel naming.

pub mod memory;
pub mod wire;

use crate::error::Result;
use crate::types::DocId;
use std::sync::Arc;

pub use memory::InMemoryBus;
pub use wire::{WireCodec, WireFormat};

/// Callback invoked with `(channel, payload)` for each delivered message.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Identifies one handler registration on a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

pub trait MessageBus: Send + Sync {
    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<SubscriptionToken>;

    fn unsubscribe(&self, channel: &str, token: SubscriptionToken) -> Result<()>;

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
}

/// Builds channel names with an optional deployment-wide prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.unwrap_or("").to_string(),
        }
    }

    /// Collection-wide channel.
    pub fn collection(&self, collection: &str) -> String {
        format!("{}{}", self.prefix, collection)
    }

    /// Per-document channel.
    pub fn dedicated(&self, collection: &str, id: &DocId) -> String {
        format!("{}{}::{}", self.prefix, collection, id)
    }

    /// A caller-supplied channel name.
    pub fn custom(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Collection named by a collection or per-document channel.
    pub fn collection_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        let rest = channel.strip_prefix(self.prefix.as_str())?;
        let collection = rest.split_once("::").map_or(rest, |(c, _)| c);
        (!collection.is_empty()).then_some(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let plain = ChannelNames::new(None);
        assert_eq!(plain.collection("tasks"), "tasks");
        assert_eq!(plain.dedicated("tasks", &DocId::new("t1")), "tasks::t1");

        let prefixed = ChannelNames::new(Some("app1."));
        assert_eq!(prefixed.collection("tasks"), "app1.tasks");
        assert_eq!(prefixed.dedicated("tasks", &DocId::new("t1")), "app1.tasks::t1");
        assert_eq!(prefixed.custom("feed"), "app1.feed");
    }

    #[test]
    fn test_collection_of_channel() {
        let prefixed = ChannelNames::new(Some("app1."));
        assert_eq!(prefixed.collection_of("app1.tasks"), Some("tasks"));
        assert_eq!(prefixed.collection_of("app1.tasks::~7"), Some("tasks"));
        assert_eq!(prefixed.collection_of("other.tasks"), None);
        assert_eq!(prefixed.collection_of("app1."), None);
    }
}
