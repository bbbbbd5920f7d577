//! Maps bus channels to subscribers and turns events into cache updates and
//! result set changes.
//!
//! Every registry mutation (attach, detach, watch) and every event runs on
//! the router's [`SerialQueue`], so a channel is never torn down while an
//! event for it is being delivered. Events published by this process carry
//! its instance id and are dropped when they come back over the bus, since
//! they were already applied optimistically.

use crate::bus::{ChannelNames, MessageBus, MessageHandler, SubscriptionToken, WireCodec};
use crate::collection::{CollectionContext, CollectionDirectory};
use crate::diff::top_level_diff;
use crate::error::{Result, SyncError};
use crate::events::{EventKind, MutationEvent};
use crate::observe::{Delivery, ResolvedEvent, Subscriber, SubscriberId};
use crate::queue::SerialQueue;
use crate::race::{RaceDetector, Touch};
use crate::types::{DocId, InstanceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct ChannelEntry {
    collection: String,
    subscribers: Vec<Arc<Subscriber>>,
    /// Watch references (dedicated channels only).
    watchers: usize,
    token: Option<SubscriptionToken>,
}

impl ChannelEntry {
    fn is_unused(&self) -> bool {
        self.subscribers.is_empty() && self.watchers == 0
    }
}

pub struct ChannelRouter {
    instance_id: InstanceId,
    bus: Arc<dyn MessageBus>,
    codec: WireCodec,
    names: ChannelNames,
    race: Arc<RaceDetector>,
    collections: Arc<CollectionDirectory>,
    queue: SerialQueue,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    self_ref: Weak<ChannelRouter>,
}

impl ChannelRouter {
    pub fn new(
        instance_id: InstanceId,
        bus: Arc<dyn MessageBus>,
        codec: WireCodec,
        names: ChannelNames,
        race: Arc<RaceDetector>,
        collections: Arc<CollectionDirectory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            instance_id,
            bus,
            codec,
            names,
            race,
            collections,
            queue: SerialQueue::new("router"),
            channels: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    fn this(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| SyncError::InvalidOperation("router dropped".to_string()))
    }

    // --- Channel bookkeeping ---

    /// Register a subscriber on all of its channels.
    pub fn attach(&self, subscriber: Arc<Subscriber>) -> Result<()> {
        let this = self.this()?;
        self.queue.run_task(move || this.attach_now(subscriber))?
    }

    fn attach_now(&self, subscriber: Arc<Subscriber>) -> Result<()> {
        let collection = subscriber.collection().to_string();
        for channel in subscriber.channels() {
            self.open_channel(channel, &collection)?;
            if let Some(entry) = self.channels.lock().get_mut(channel) {
                entry.subscribers.push(subscriber.clone());
            }
        }
        tracing::debug!(subscriber = %subscriber.id(), channels = subscriber.channels().len(), "subscriber attached");
        Ok(())
    }

    /// Deregister a subscriber. Runs asynchronously on the router queue.
    pub fn detach(&self, id: SubscriberId) {
        let Ok(this) = self.this() else {
            return;
        };
        self.queue.queue_task(move || {
            let emptied: Vec<String> = {
                let mut channels = this.channels.lock();
                channels
                    .iter_mut()
                    .filter_map(|(name, entry)| {
                        let before = entry.subscribers.len();
                        entry.subscribers.retain(|s| s.id() != id);
                        (entry.subscribers.len() != before && entry.is_unused()).then(|| name.clone())
                    })
                    .collect()
            };
            for channel in emptied {
                this.close_channel(&channel);
            }
            tracing::debug!(subscriber = %id, "subscriber detached");
        });
    }

    /// Keep a document's dedicated channel open and its cache entry pinned.
    pub fn add_watch(&self, collection: &str, id: &DocId) -> Result<()> {
        let this = self.this()?;
        let (collection, id) = (collection.to_string(), id.clone());
        self.queue.run_task(move || -> Result<()> {
            let channel = this.names.dedicated(&collection, &id);
            this.open_channel(&channel, &collection)?;
            if let Some(entry) = this.channels.lock().get_mut(&channel) {
                entry.watchers += 1;
            }
            if let Some(ctx) = this.collections.get(&collection) {
                ctx.cache().pin(&id);
            }
            Ok(())
        })?
    }

    pub fn remove_watch(&self, collection: &str, id: &DocId) -> Result<()> {
        let this = self.this()?;
        let (collection, id) = (collection.to_string(), id.clone());
        self.queue.run_task(move || {
            let channel = this.names.dedicated(&collection, &id);
            let close = {
                let mut channels = this.channels.lock();
                match channels.get_mut(&channel) {
                    Some(entry) if entry.watchers > 0 => {
                        entry.watchers -= 1;
                        entry.is_unused()
                    }
                    _ => return,
                }
            };
            if let Some(ctx) = this.collections.get(&collection) {
                ctx.cache().unpin(&id);
            }
            if close {
                this.close_channel(&channel);
            }
        })
    }

    fn open_channel(&self, channel: &str, collection: &str) -> Result<()> {
        if self.channels.lock().contains_key(channel) {
            return Ok(());
        }
        let token = self.bus.subscribe(channel, self.bus_handler())?;
        self.channels.lock().insert(
            channel.to_string(),
            ChannelEntry {
                collection: collection.to_string(),
                subscribers: Vec::new(),
                watchers: 0,
                token: Some(token),
            },
        );
        tracing::debug!(channel, collection, "subscribed to channel");
        Ok(())
    }

    fn close_channel(&self, channel: &str) {
        let entry = {
            let mut channels = self.channels.lock();
            match channels.get(channel) {
                Some(entry) if entry.is_unused() => channels.remove(channel),
                _ => None,
            }
        };
        let Some(token) = entry.and_then(|e| e.token) else {
            return;
        };
        match self.bus.unsubscribe(channel, token) {
            Ok(()) => tracing::debug!(channel, "unsubscribed from channel"),
            Err(e) => tracing::warn!(channel, error = %e, "unsubscribe failed"),
        }
    }

    fn bus_handler(&self) -> MessageHandler {
        let router = self.self_ref.clone();
        Arc::new(move |channel: &str, payload: &[u8]| {
            if let Some(router) = router.upgrade() {
                router.on_message(channel, payload);
            }
        })
    }

    fn on_message(&self, channel: &str, payload: &[u8]) {
        let event = match self.codec.decode(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel, error = %e, "dropping undecodable message");
                return;
            }
        };
        let Ok(this) = self.this() else {
            return;
        };
        let channel = channel.to_string();
        self.queue.queue_task(move || {
            if let Err(e) = this.process_now(&channel, event, true) {
                tracing::warn!(channel = %channel, error = %e, "bus event not applied");
            }
        });
    }

    // --- Event processing ---

    /// Apply a locally produced event now, ahead of the bus round-trip.
    pub fn process_local(&self, channel: &str, event: MutationEvent) -> Result<()> {
        let this = self.this()?;
        let channel = channel.to_string();
        self.queue
            .run_task(move || this.process_now(&channel, event, false))?
    }

    fn process_now(&self, channel: &str, event: MutationEvent, from_bus: bool) -> Result<()> {
        if from_bus && event.origin.as_ref() == Some(&self.instance_id) {
            tracing::trace!(channel, "dropping self-originated echo");
            return Ok(());
        }
        if event.kind.is_forced() {
            self.note_correction(channel, &event);
        }
        let (collection, subscribers) = {
            let channels = self.channels.lock();
            match channels.get(channel) {
                Some(entry) => (entry.collection.clone(), entry.subscribers.clone()),
                None => return Ok(()),
            }
        };
        let Some(ctx) = self.collections.get(&collection) else {
            tracing::warn!(channel, collection = %collection, "event for unknown collection");
            return Ok(());
        };
        let Some(id) = event.doc_id() else {
            tracing::warn!(channel, "event without _id dropped");
            return Ok(());
        };

        if from_bus {
            self.observe_remote(&collection, &id, &event);
        }
        let Some(resolved) = self.apply_to_cache(&ctx, &id, &event)? else {
            return Ok(());
        };

        tracing::trace!(channel, id = %id, kind = ?event.kind, subscribers = subscribers.len(), "routing event");
        let mode = if from_bus {
            Delivery::Queued
        } else {
            Delivery::Immediate
        };
        let mut first_error = None;
        for subscriber in subscribers {
            if let Err(e) = subscriber.deliver(resolved.clone(), mode) {
                tracing::error!(subscriber = %subscriber.id(), id = %id, error = %e, "delivery failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) if !from_bus => Err(e),
            _ => Ok(()),
        }
    }

    /// A correction seen on any channel settles a pending local one, even
    /// where nothing here observes that channel.
    fn note_correction(&self, channel: &str, event: &MutationEvent) {
        if let (Some(collection), Some(id)) = (self.names.collection_of(channel), event.doc_id()) {
            self.race.on_force(collection, &id);
        }
    }

    fn observe_remote(&self, collection: &str, id: &DocId, event: &MutationEvent) {
        let touch = match event.kind {
            EventKind::Insert => Touch::inserted(&event.doc),
            EventKind::Update => Touch::from_doc(&event.doc, &event.fields, &event.cleared),
            EventKind::Remove => Touch::Removed,
            EventKind::ForcedUpdate | EventKind::ForcedRemove => return,
        };
        self.race.on_mutation(collection, id, touch);
    }

    /// Merge an event into the cache. `None` means the event is stale.
    fn apply_to_cache(
        &self,
        ctx: &CollectionContext,
        id: &DocId,
        event: &MutationEvent,
    ) -> Result<Option<ResolvedEvent>> {
        let cache = ctx.cache();
        let resolved = match event.kind {
            EventKind::Insert => {
                cache.set(event.doc.clone())?;
                ResolvedEvent {
                    kind: event.kind,
                    id: id.clone(),
                    doc: Some(event.doc.clone()),
                    fields: None,
                }
            }
            EventKind::Update => {
                let Some(mut doc) = ctx.fetch_one(id)? else {
                    tracing::debug!(collection = %ctx.name(), id = %id, "update for vanished document dropped");
                    return Ok(None);
                };
                for field in &event.fields {
                    if event.cleared.contains(field) {
                        continue;
                    }
                    if let Some(value) = event.doc.get(field) {
                        doc.insert(field.clone(), value.clone());
                    }
                }
                for field in &event.cleared {
                    doc.remove(field);
                }
                cache.set(doc.clone())?;
                let mut fields = event.fields.clone();
                fields.extend(event.cleared.iter().filter(|c| !event.fields.contains(c)).cloned());
                ResolvedEvent {
                    kind: event.kind,
                    id: id.clone(),
                    doc: Some(doc),
                    fields: Some(fields),
                }
            }
            EventKind::ForcedUpdate => {
                let previous = cache.get(id);
                cache.set(event.doc.clone())?;
                ResolvedEvent {
                    kind: event.kind,
                    id: id.clone(),
                    doc: Some(event.doc.clone()),
                    fields: previous.map(|old| top_level_diff(&old, &event.doc).all_fields()),
                }
            }
            EventKind::Remove | EventKind::ForcedRemove => {
                cache.delete(id);
                ResolvedEvent::removal(event.kind, id.clone())
            }
        };
        Ok(Some(resolved))
    }

    /// Re-synchronize every live subscriber after events may have been lost.
    pub fn reload_all(&self) -> Result<()> {
        let this = self.this()?;
        self.queue.run_task(move || {
            let mut seen = Vec::new();
            let subscribers: Vec<Arc<Subscriber>> = {
                let channels = this.channels.lock();
                channels
                    .values()
                    .flat_map(|entry| entry.subscribers.iter().cloned())
                    .filter(|s| {
                        if seen.contains(&s.id()) {
                            return false;
                        }
                        seen.push(s.id());
                        true
                    })
                    .collect()
            };
            tracing::info!(subscribers = subscribers.len(), "reloading all result sets");
            for subscriber in subscribers {
                if let Err(e) = subscriber.reload() {
                    tracing::warn!(subscriber = %subscriber.id(), error = %e, "reload failed");
                }
            }
        })
    }

    /// Returns once every task queued before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.queue.run_task(|| ())
    }

    /// Unsubscribe from every channel.
    pub fn shutdown(&self) {
        let entries: Vec<(String, ChannelEntry)> = self.channels.lock().drain().collect();
        for (channel, entry) in entries {
            if let Some(token) = entry.token {
                if let Err(e) = self.bus.unsubscribe(&channel, token) {
                    tracing::warn!(channel = %channel, error = %e, "unsubscribe failed");
                }
            }
        }
    }

    // --- Introspection ---

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.lock().contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn watcher_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map(|e| e.watchers).unwrap_or(0)
    }
}
