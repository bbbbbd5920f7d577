//! Turns committed local writes into change events.
//!
//! Each event goes to the document's dedicated channel plus either the
//! collection channel or the write's explicit channels. An optimistic event
//! is routed locally first, tagged with this process's instance id, and then
//! published so other processes converge.

use crate::bus::{ChannelNames, MessageBus, WireCodec};
use crate::collection::CollectionContext;
use crate::config::MutationDefaults;
use crate::error::{Result, SyncError};
use crate::events::{EventKind, MutationEvent};
use crate::race::{RaceDetector, Touch};
use crate::router::ChannelRouter;
use crate::types::{id_document, DocId, Document, InstanceId};
use std::sync::Arc;

/// Per-write overrides. Unset flags fall back to the registry defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOptions {
    pub optimistic: Option<bool>,
    pub push_to_bus: Option<bool>,
    /// Publish on these channels instead of the collection channel.
    pub channels: Option<Vec<String>>,
    /// Update every match instead of the first.
    pub multi: bool,
    /// Insert when nothing matches.
    pub upsert: bool,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, on: bool) -> Self {
        self.optimistic = Some(on);
        self
    }

    pub fn push_to_bus(mut self, on: bool) -> Self {
        self.push_to_bus = Some(on);
        self
    }

    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channels.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

pub struct MutationDispatcher {
    instance_id: InstanceId,
    names: ChannelNames,
    codec: WireCodec,
    bus: Arc<dyn MessageBus>,
    router: Arc<ChannelRouter>,
    race: Arc<RaceDetector>,
    defaults: MutationDefaults,
    external_publisher: bool,
}

impl MutationDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        names: ChannelNames,
        codec: WireCodec,
        bus: Arc<dyn MessageBus>,
        router: Arc<ChannelRouter>,
        race: Arc<RaceDetector>,
        defaults: MutationDefaults,
        external_publisher: bool,
    ) -> Self {
        Self {
            instance_id,
            names,
            codec,
            bus,
            router,
            race,
            defaults,
            external_publisher,
        }
    }

    pub fn dispatch_insert(
        &self,
        ctx: &CollectionContext,
        doc: &Document,
        options: &MutationOptions,
    ) -> Result<()> {
        let id = require_id(doc)?;
        self.race.on_mutation(ctx.name(), &id, Touch::inserted(doc));
        self.dispatch(ctx, &id, MutationEvent::new(EventKind::Insert, doc.clone()), options)
    }

    /// `doc` holds `_id` plus the new values of `fields`.
    pub fn dispatch_update(
        &self,
        ctx: &CollectionContext,
        doc: Document,
        fields: Vec<String>,
        cleared: Vec<String>,
        options: &MutationOptions,
    ) -> Result<()> {
        let id = require_id(&doc)?;
        self.race
            .on_mutation(ctx.name(), &id, Touch::from_doc(&doc, &fields, &cleared));
        let event = MutationEvent::new(EventKind::Update, doc).with_fields(fields, cleared);
        self.dispatch(ctx, &id, event, options)
    }

    pub fn dispatch_remove(
        &self,
        ctx: &CollectionContext,
        id: &DocId,
        options: &MutationOptions,
    ) -> Result<()> {
        self.race.on_mutation(ctx.name(), id, Touch::Removed);
        self.dispatch(ctx, id, MutationEvent::new(EventKind::Remove, id_document(id)), options)
    }

    /// Broadcast an authoritative snapshot of a document.
    pub fn dispatch_forced_update(&self, ctx: &CollectionContext, doc: Document) -> Result<()> {
        let id = require_id(&doc)?;
        self.dispatch_forced(ctx, &id, MutationEvent::new(EventKind::ForcedUpdate, doc))
    }

    pub fn dispatch_forced_remove(&self, ctx: &CollectionContext, id: &DocId) -> Result<()> {
        self.dispatch_forced(
            ctx,
            id,
            MutationEvent::new(EventKind::ForcedRemove, id_document(id)),
        )
    }

    fn channels(&self, ctx: &CollectionContext, id: &DocId, explicit: Option<&[String]>) -> Vec<String> {
        let mut channels = vec![self.names.dedicated(ctx.name(), id)];
        match explicit {
            Some(list) => channels.extend(list.iter().map(|c| self.names.custom(c))),
            None => channels.push(self.names.collection(ctx.name())),
        }
        channels
    }

    fn publishes(&self, ctx: &CollectionContext, options: &MutationOptions) -> bool {
        options.push_to_bus.unwrap_or(self.defaults.push_to_bus)
            && !ctx.is_bus_disabled()
            && !self.external_publisher
    }

    fn dispatch(
        &self,
        ctx: &CollectionContext,
        id: &DocId,
        event: MutationEvent,
        options: &MutationOptions,
    ) -> Result<()> {
        let channels = self.channels(ctx, id, options.channels.as_deref());
        let optimistic = options.optimistic.unwrap_or(self.defaults.optimistic);
        let event = if optimistic {
            event.with_origin(self.instance_id.clone())
        } else {
            event
        };

        let mut first_error = None;
        if optimistic {
            for channel in &channels {
                if let Err(e) = self.router.process_local(channel, event.clone()) {
                    first_error.get_or_insert(e);
                }
            }
        }
        if self.publishes(ctx, options) {
            self.publish(&channels, &event)?;
        }
        first_error.map_or(Ok(()), Err)
    }

    fn dispatch_forced(&self, ctx: &CollectionContext, id: &DocId, event: MutationEvent) -> Result<()> {
        let channels = self.channels(ctx, id, None);
        tracing::debug!(collection = %ctx.name(), id = %id, kind = ?event.kind, "dispatching correction");
        if ctx.is_bus_disabled() || self.external_publisher {
            for channel in &channels {
                self.router.process_local(channel, event.clone())?;
            }
            return Ok(());
        }
        self.publish(&channels, &event)
    }

    /// Publish on every channel. The write already committed, so bus
    /// failures are logged rather than returned.
    fn publish(&self, channels: &[String], event: &MutationEvent) -> Result<()> {
        let payload = self.codec.encode(event)?;
        for channel in channels {
            if let Err(e) = self.bus.publish(channel, &payload) {
                tracing::warn!(channel = %channel, error = %e, "publish failed");
            }
        }
        Ok(())
    }
}

fn require_id(doc: &Document) -> Result<DocId> {
    DocId::of(doc).ok_or_else(|| SyncError::InvalidOperation("document without _id".to_string()))
}
