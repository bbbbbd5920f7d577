//! The per-process registry of collections, observers and channels.

use crate::bus::{ChannelNames, MessageBus, WireCodec};
use crate::cache::DocumentCache;
use crate::collection::{Collection, CollectionContext, CollectionDirectory};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::mutation::MutationDispatcher;
use crate::observe::{
    ObservableResultSet, ObserveCallbacks, ObserveHandle, ResultSetMultiplexer, Strategy,
    Subscriber, SubscriberId,
};
use crate::query::{normalize_selector, QueryOptions};
use crate::race::RaceDetector;
use crate::router::ChannelRouter;
use crate::store::DocumentStore;
use crate::timer::{PeriodicTask, TimerService};
use crate::types::{DocId, InstanceId, QueryKey};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// State shared by the registry and every [`Collection`] handle.
pub(crate) struct RegistryShared {
    pub(crate) config: SyncConfig,
    pub(crate) instance_id: InstanceId,
    pub(crate) names: ChannelNames,
    pub(crate) timers: Arc<TimerService>,
    pub(crate) race: Arc<RaceDetector>,
    pub(crate) collections: Arc<CollectionDirectory>,
    pub(crate) router: Arc<ChannelRouter>,
    pub(crate) dispatcher: MutationDispatcher,
    multiplexers: Mutex<HashMap<QueryKey, Arc<ResultSetMultiplexer>>>,
    next_subscriber: AtomicU64,
    shut_down: AtomicBool,
}

impl RegistryShared {
    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        Ok(())
    }

    /// Attach an observer, sharing one result set between identical queries.
    pub(crate) fn observe(
        self: &Arc<Self>,
        ctx: &Arc<CollectionContext>,
        selector: Value,
        options: QueryOptions,
        callbacks: ObserveCallbacks,
    ) -> Result<ObserveHandle> {
        self.ensure_running()?;
        let selector = normalize_selector(selector)?;
        if options.fields.as_ref().is_some_and(|p| p.excludes_id()) {
            return Err(SyncError::InvalidOperation(
                "projections must keep _id".to_string(),
            ));
        }
        let strategy = Strategy::select(&selector, &options);
        let options = strategy.normalize_options(options);
        let key = query_key(ctx.name(), &selector, &options)?;

        let (mux, created) = {
            let mut muxes = self.multiplexers.lock();
            let reusable = muxes
                .get(&key)
                .filter(|m| m.reserve_attach().is_ok())
                .cloned();
            match reusable {
                Some(mux) => (mux, false),
                None => {
                    let mux = ResultSetMultiplexer::new(ctx.name(), ctx.cache().clone(), options.fields.clone());
                    mux.reserve_attach()?;
                    muxes.insert(key.clone(), mux.clone());
                    (mux, true)
                }
            }
        };

        if created {
            self.start_result_set(ctx, &key, &mux, selector, options, strategy)?;
        }
        mux.complete_attach(callbacks)
    }

    fn start_result_set(
        self: &Arc<Self>,
        ctx: &Arc<CollectionContext>,
        key: &QueryKey,
        mux: &Arc<ResultSetMultiplexer>,
        selector: Value,
        options: QueryOptions,
        strategy: Strategy,
    ) -> Result<()> {
        let channels = strategy.channels(ctx.name(), &options, &self.names);
        let result_set = Arc::new(ObservableResultSet::new(ctx.clone(), selector, options, mux.clone()));
        let subscriber = Arc::new(Subscriber::new(
            SubscriberId(self.next_subscriber.fetch_add(1, Ordering::SeqCst)),
            channels,
            strategy,
            result_set.clone(),
        ));

        let fetch_ctx = ctx.clone();
        mux.set_fetch_fallback(Arc::new(move |id: &DocId| fetch_ctx.fetch_one(id)));

        let shared = Arc::downgrade(self);
        let owner = Arc::downgrade(mux);
        let key = key.clone();
        let subscriber_id = subscriber.id();
        mux.set_on_stop(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.on_multiplexer_stopped(&key, &owner, subscriber_id);
            }
        }));

        tracing::debug!(
            collection = %ctx.name(),
            subscriber = %subscriber_id,
            strategy = ?subscriber.strategy(),
            "starting result set"
        );
        if let Err(e) = self.router.attach(subscriber.clone()) {
            mux.query_error(&e);
            return Err(e);
        }
        result_set.init()?;
        subscriber.finish_init()
    }

    fn on_multiplexer_stopped(&self, key: &QueryKey, owner: &Weak<ResultSetMultiplexer>, subscriber: SubscriberId) {
        {
            let mut muxes = self.multiplexers.lock();
            if muxes.get(key).is_some_and(|m| std::ptr::eq(Arc::as_ptr(m), owner.as_ptr())) {
                muxes.remove(key);
            }
        }
        self.router.detach(subscriber);
    }

    /// Re-read a document from the authoritative source and broadcast it.
    fn correct(&self, collection: &str, id: &DocId) {
        let Some(ctx) = self.collections.get(collection) else {
            return;
        };
        ctx.cache().delete(id);
        let result = match ctx.store().find_authoritative(id) {
            Ok(Some(doc)) => self.dispatcher.dispatch_forced_update(&ctx, doc),
            Ok(None) => self.dispatcher.dispatch_forced_remove(&ctx, id),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::info!(collection, id = %id, "race correction published"),
            Err(e) => tracing::warn!(collection, id = %id, error = %e, "race correction failed"),
        }
    }
}

/// Stable key of a distinct observed query.
fn query_key(collection: &str, selector: &Value, options: &QueryOptions) -> Result<QueryKey> {
    let canonical = serde_json::to_vec(&json!({
        "collection": collection,
        "selector": selector,
        "options": options,
    }))?;
    Ok(QueryKey::from_bytes(&canonical))
}

/// Live query synchronization for one process.
///
/// Identical queries share one result set. Several registries attached to
/// the same bus converge on each other's writes.
pub struct SyncRegistry {
    shared: Arc<RegistryShared>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl SyncRegistry {
    pub fn new(config: SyncConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        config.validate()?;
        let instance_id = InstanceId::generate();
        let names = ChannelNames::new(config.channel_prefix.as_deref());
        let codec = WireCodec::new(config.wire_format);
        let timers = Arc::new(TimerService::new());
        let race = RaceDetector::new(config.race_detection.clone(), timers.clone());
        let collections = Arc::new(CollectionDirectory::default());
        let router = ChannelRouter::new(
            instance_id.clone(),
            bus.clone(),
            codec,
            names.clone(),
            race.clone(),
            collections.clone(),
        );
        let dispatcher = MutationDispatcher::new(
            instance_id.clone(),
            names.clone(),
            codec,
            bus,
            router.clone(),
            race.clone(),
            config.mutation_defaults,
            config.external_publisher,
        );

        let shared = Arc::new(RegistryShared {
            config,
            instance_id,
            names,
            timers,
            race,
            collections,
            router,
            dispatcher,
            multiplexers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        shared.race.set_corrector(Arc::new(move |collection: &str, id: &DocId| {
            if let Some(shared) = weak.upgrade() {
                shared.correct(collection, id);
            }
        }));

        let tasks = Self::spawn_maintenance(&shared);
        tracing::info!(instance = %shared.instance_id, "sync registry started");
        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    fn spawn_maintenance(shared: &Arc<RegistryShared>) -> Vec<PeriodicTask> {
        let mut tasks = Vec::new();
        let weak = Arc::downgrade(shared);
        tasks.push(PeriodicTask::spawn(
            "cache-sweep",
            shared.config.cache_sweep_interval,
            move || {
                if let Some(shared) = weak.upgrade() {
                    let evicted: usize = shared.collections.all().iter().map(|c| c.cache().sweep()).sum();
                    if evicted > 0 {
                        tracing::debug!(evicted, "cache sweep");
                    }
                }
            },
        ));
        if shared.race.is_enabled() {
            let weak = Arc::downgrade(shared);
            tasks.push(PeriodicTask::spawn(
                "race-gc",
                shared.config.race_detection.gc_interval(),
                move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.race.gc();
                    }
                },
            ));
        }
        tasks
    }

    /// Handle on a collection backed by `store`. The first store registered
    /// under a name is kept.
    pub fn collection(&self, name: &str, store: Arc<dyn DocumentStore>) -> Collection {
        let ctx = match self.shared.collections.get(name) {
            Some(existing) => existing,
            None => {
                let cache = Arc::new(DocumentCache::new(
                    self.shared.config.cache_timeout,
                    self.shared.config.cache_max_entries,
                ));
                self.shared
                    .collections
                    .insert(Arc::new(CollectionContext::new(name, store, cache)))
            }
        };
        Collection::new(ctx, self.shared.clone())
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.shared.instance_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Number of distinct live queries.
    pub fn result_set_count(&self) -> usize {
        self.shared.multiplexers.lock().len()
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.shared.router
    }

    pub fn race_detector(&self) -> &Arc<RaceDetector> {
        &self.shared.race
    }

    /// Re-synchronize every result set, e.g. after the bus reconnected.
    pub fn reload_all(&self) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.router.reload_all()
    }

    /// Returns once routed events and result set deliveries queued before
    /// this call have been applied.
    pub fn flush(&self) -> Result<()> {
        self.shared.router.flush()?;
        let muxes: Vec<Arc<ResultSetMultiplexer>> =
            self.shared.multiplexers.lock().values().cloned().collect();
        for mux in muxes {
            mux.flush()?;
        }
        Ok(())
    }

    /// Stop every observer, unsubscribe from the bus and stop timers.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for mut task in self.tasks.lock().drain(..) {
            task.stop();
        }
        let muxes: Vec<Arc<ResultSetMultiplexer>> =
            self.shared.multiplexers.lock().drain().map(|(_, m)| m).collect();
        for mux in muxes {
            mux.force_stop();
        }
        self.shared.router.flush().ok();
        self.shared.router.shutdown();
        self.shared.timers.shutdown();
        tracing::info!(instance = %self.shared.instance_id, "sync registry stopped");
    }
}

impl Drop for SyncRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
