use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sentinel_common::config::MemoryConfig;
use sentinel_common::ids::WorkerId;
use sentinel_common::{keys, Result};

use crate::events::{CoordinationEvent, EventBus};

use super::backend::MemoryBackend;
use super::cache::SyncCache;
use super::clock::{ClockOrdering, VectorClock};
use super::conflict::{ConflictResolver, Resolution, ResolverRegistry};
use super::MemoryEntry;

/// Options for a single write.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// TTL override; the configured default applies when absent.
    pub ttl_seconds: Option<u64>,
    /// Value type tag selecting a registered conflict resolver
    /// ("set", "map", "counter", or consumer-defined).
    pub value_type: Option<String>,
}

impl WriteOptions {
    pub fn ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
            value_type: None,
        }
    }
}

/// Handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SubscriberFn = Arc<dyn Fn(&str, &MemoryEntry) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    prefix: String,
    callback: SubscriberFn,
}

/// Counter snapshot, exposed through `get_metrics`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncMetrics {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub flushed_entries: u64,
    pub flush_failures: u64,
    pub conflicts_resolved: u64,
    pub pending: u64,
}

/// Guards cache, clock, pending buffer and resolver registry. A std mutex:
/// never held across an await point.
struct SyncInner {
    cache: SyncCache,
    clock: VectorClock,
    pending: Vec<(String, MemoryEntry)>,
    resolvers: ResolverRegistry,
}

/// Replicates per-task and per-worker state through the memory backend with
/// vector-clock causality, batched writes and prefix subscriptions.
///
/// Process-wide service: construct once, `start()` the flusher, `stop()` on
/// shutdown.
pub struct MemorySynchronizer {
    backend: Arc<dyn MemoryBackend>,
    local: WorkerId,
    config: MemoryConfig,
    inner: Mutex<SyncInner>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    events: EventBus,
    flusher: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,

    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    flushed_entries: AtomicU64,
    flush_failures: AtomicU64,
    conflicts_resolved: AtomicU64,
}

impl MemorySynchronizer {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        local: WorkerId,
        config: MemoryConfig,
        events: EventBus,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            backend,
            local,
            inner: Mutex::new(SyncInner {
                cache: SyncCache::new(config.cache_size),
                clock: VectorClock::new(),
                pending: Vec::new(),
                resolvers: ResolverRegistry::with_builtins(),
            }),
            config,
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            events,
            flusher: Mutex::new(None),
            shutdown_tx,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flushed_entries: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
        })
    }

    /// Spawn the background flusher. Idempotent per instance.
    pub fn start(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock().unwrap();
        if flusher.is_some() {
            return;
        }

        let sync = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let batch_interval = Duration::from_millis(self.config.batch_interval_ms);
        let rollup_interval = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));

        *flusher = Some(tokio::spawn(async move {
            let mut last_rollup = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(batch_interval) => {
                        sync.flush().await;

                        if last_rollup.elapsed() >= rollup_interval {
                            sync.publish_rollup().await;
                            last_rollup = tokio::time::Instant::now();
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // Drain whatever accumulated since the last tick.
            sync.flush().await;
            tracing::debug!("Memory flusher stopped");
        }));

        tracing::info!(
            batch_interval_ms = self.config.batch_interval_ms,
            cache_size = self.config.cache_size,
            "Memory synchronizer started"
        );
    }

    /// Signal the flusher and wait for its final flush.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Latest value for a key: pending buffer first (read-your-writes),
    /// then cache, then backend.
    pub async fn read(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.read_entry(key).await?.map(|entry| entry.value))
    }

    /// Latest full entry for a key.
    pub async fn read_entry(&self, key: &str) -> Result<Option<MemoryEntry>> {
        keys::validate(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sync.reads").increment(1);

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some((_, entry)) = inner.pending.iter().rev().find(|(k, _)| k == key) {
                return Ok(Some(entry.clone()));
            }
            if let Some(entry) = inner.cache.get(key) {
                return Ok(Some(entry));
            }
        }

        self.fetch_and_cache(key).await
    }

    /// Read straight from the backend, bypassing pending buffer and cache.
    /// Used as the anti-race guard before stale-lock recovery.
    pub async fn read_entry_uncached(&self, key: &str) -> Result<Option<MemoryEntry>> {
        keys::validate(key)?;
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let entry: MemoryEntry = serde_json::from_str(&raw)?;
        Ok(Some(entry))
    }

    async fn fetch_and_cache(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let remote: MemoryEntry = serde_json::from_str(&raw)?;

        let (entry, resolution) = {
            let mut inner = self.inner.lock().unwrap();
            inner.clock.observe(&remote.clock);

            // A resident invalidated line means one of our writes to this
            // key raced the remote one; if causality can't order them,
            // resolve instead of silently taking either side.
            let stale = inner.cache.peek_invalidated(key).cloned();
            match stale {
                Some(stale)
                    if stale.clock.compare(&remote.clock) == ClockOrdering::Concurrent
                        && stale.value != remote.value =>
                {
                    let value_type = infer_value_type(&remote.value);
                    let resolution = inner
                        .resolvers
                        .resolve(value_type, vec![stale, remote]);
                    inner.cache.insert(key.to_string(), resolution.entry.clone());
                    (resolution.entry.clone(), Some(resolution))
                }
                _ => {
                    inner.cache.insert(key.to_string(), remote.clone());
                    (remote, None)
                }
            }
        };

        if let Some(resolution) = &resolution {
            self.emit_conflict(key, resolution);
        }
        Ok(Some(entry))
    }

    /// Enqueue a write. The entry is visible to local reads immediately and
    /// reaches the backend on the next flush.
    pub fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<MemoryEntry> {
        keys::validate(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sync.writes").increment(1);

        let ttl = options
            .ttl_seconds
            .or(Some(self.config.default_ttl_seconds));

        let mut inner = self.inner.lock().unwrap();
        inner.clock.increment(self.local);

        let entry = MemoryEntry {
            value,
            clock: inner.clock.clone(),
            timestamp: Utc::now(),
            owner: self.local,
            ttl_seconds: ttl,
        };

        inner.cache.invalidate(key);
        inner.pending.push((key.to_string(), entry.clone()));
        Ok(entry)
    }

    /// Write-through variant: the entry goes to the backend immediately,
    /// bypassing the batch buffer, and the error (if any) surfaces to the
    /// caller. Used for liveness publication where a lost write must not
    /// be silent.
    pub async fn put_now(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<MemoryEntry> {
        let entry = {
            keys::validate(key)?;
            self.writes.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sync.writes").increment(1);

            let ttl = options
                .ttl_seconds
                .or(Some(self.config.default_ttl_seconds));

            let mut inner = self.inner.lock().unwrap();
            inner.clock.increment(self.local);
            let entry = MemoryEntry {
                value,
                clock: inner.clock.clone(),
                timestamp: Utc::now(),
                owner: self.local,
                ttl_seconds: ttl,
            };
            inner.cache.invalidate(key);
            entry
        };

        let serialized = serde_json::to_string(&entry)?;
        self.backend
            .put(key, &serialized, entry.ttl_seconds)
            .await?;

        let mut inner = self.inner.lock().unwrap();
        if !inner.pending.iter().any(|(k, _)| k == key) {
            inner.cache.insert(key.to_string(), entry.clone());
        }
        drop(inner);

        self.notify(&[(key.to_string(), entry.clone())]);
        Ok(entry)
    }

    /// Delete bypasses the batch buffer: backend delete, cache drop, and
    /// any still-pending writes for the key are discarded.
    pub async fn delete(&self, key: &str) -> Result<()> {
        keys::validate(key)?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sync.deletes").increment(1);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.cache.remove(key);
            inner.pending.retain(|(k, _)| k != key);
        }

        self.backend.delete(key).await
    }

    /// Forwarded prefix search.
    pub async fn search(&self, prefix: &str) -> Result<Vec<String>> {
        keys::validate(prefix)?;
        self.backend.search(prefix).await
    }

    /// Flush the pending buffer to the backend and notify subscribers for
    /// every key that landed. Failed puts are logged and dropped
    /// (at-most-once writes); their subscribers are not notified.
    pub async fn flush(&self) -> usize {
        let batch: Vec<(String, MemoryEntry)> = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.pending)
        };

        if batch.is_empty() {
            return 0;
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let mut landed: Vec<(String, MemoryEntry)> = Vec::with_capacity(batch.len());
        for (key, entry) in batch {
            // A concurrent remote write already on the backend would be
            // silently clobbered by a plain put; merge with it instead.
            let entry = self.merge_with_backend(&key, entry).await;
            let serialized = match serde_json::to_string(&entry) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to serialize entry");
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            match self
                .backend
                .put(&key, &serialized, entry.ttl_seconds)
                .await
            {
                Ok(()) => landed.push((key, entry)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Flush write failed, dropping entry");
                    metrics::counter!("sync.flush.failures").increment(1);
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            for (key, entry) in &landed {
                // Only re-validate if no newer local write invalidated the
                // line again while the batch was in flight.
                if !inner.pending.iter().any(|(k, _)| k == key) {
                    inner.cache.insert(key.clone(), entry.clone());
                }
            }
        }

        self.flushed_entries
            .fetch_add(landed.len() as u64, Ordering::Relaxed);
        metrics::counter!("sync.flush.entries").increment(landed.len() as u64);

        self.notify(&landed);
        landed.len()
    }

    /// Resolve an outgoing entry against whatever the backend currently
    /// holds. Entries causally ordered with ours pass through untouched;
    /// a concurrent one from another worker is collapsed by the resolver
    /// for the value's shape.
    async fn merge_with_backend(&self, key: &str, outgoing: MemoryEntry) -> MemoryEntry {
        let existing = match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<MemoryEntry>(&raw) {
                Ok(existing) => existing,
                Err(_) => return outgoing,
            },
            _ => return outgoing,
        };

        if existing.owner == outgoing.owner
            || existing.value == outgoing.value
            || existing.clock.compare(&outgoing.clock) != ClockOrdering::Concurrent
        {
            return outgoing;
        }

        let value_type = infer_value_type(&outgoing.value);
        let resolution = {
            let inner = self.inner.lock().unwrap();
            inner
                .resolvers
                .resolve(value_type, vec![existing, outgoing])
        };
        self.emit_conflict(key, &resolution);
        resolution.entry
    }

    /// Run subscriber callbacks sequentially in the flusher's context.
    /// Slow callbacks delay later notifications, never writes.
    fn notify(&self, landed: &[(String, MemoryEntry)]) {
        let subscribers: Vec<(String, SubscriberFn)> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .map(|s| (s.prefix.clone(), Arc::clone(&s.callback)))
                .collect()
        };

        for (key, entry) in landed {
            for (prefix, callback) in &subscribers {
                if key.starts_with(prefix.as_str()) {
                    callback(key, entry);
                }
            }
        }
    }

    /// Register a callback for every flushed write under `prefix`.
    pub fn subscribe(
        &self,
        prefix: impl Into<String>,
        callback: impl Fn(&str, &MemoryEntry) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().unwrap().push(Subscription {
            id,
            prefix: prefix.into(),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().unwrap().retain(|s| s.id != id);
    }

    /// Register a custom conflict resolver for a value type tag.
    pub fn register_resolver(&self, value_type: impl Into<String>, resolver: Box<dyn ConflictResolver>) {
        self.inner
            .lock()
            .unwrap()
            .resolvers
            .register(value_type, resolver);
    }

    /// Collapse externally gathered candidates for a key (cross-region
    /// reads, subscription reconciliation). Emits `ConflictResolved` when
    /// more than one candidate went in.
    pub fn resolve_candidates(
        &self,
        key: &str,
        value_type: Option<&str>,
        candidates: Vec<MemoryEntry>,
    ) -> Resolution {
        let resolution = {
            let inner = self.inner.lock().unwrap();
            inner.resolvers.resolve(value_type, candidates)
        };
        if !resolution.discarded.is_empty() {
            self.emit_conflict(key, &resolution);
        }
        resolution
    }

    fn emit_conflict(&self, key: &str, resolution: &Resolution) {
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sync.conflicts.resolved", "strategy" => resolution.strategy)
            .increment(1);
        tracing::debug!(
            key = %key,
            strategy = resolution.strategy,
            discarded = resolution.discarded.len(),
            "Resolved concurrent entries"
        );
        self.events.publish(CoordinationEvent::ConflictResolved {
            key: key.to_string(),
            strategy: resolution.strategy,
            discarded: resolution.discarded.len(),
        });
    }

    /// Snapshot of the local vector clock.
    pub fn clock(&self) -> VectorClock {
        self.inner.lock().unwrap().clock.clone()
    }

    pub fn local_worker(&self) -> WorkerId {
        self.local
    }

    pub fn get_metrics(&self) -> SyncMetrics {
        SyncMetrics {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_entries: self.flushed_entries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            pending: self.inner.lock().unwrap().pending.len() as u64,
        }
    }

    /// Periodic shared metrics roll-up under `coordination/metrics`.
    async fn publish_rollup(&self) {
        let snapshot = self.get_metrics();
        let value = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(_) => return,
        };
        if self
            .write(&keys::coordination_metrics(), value, WriteOptions::default())
            .is_ok()
        {
            self.flush().await;
        }
    }
}

/// Pick a resolver family from the JSON shape when the writer didn't tag
/// the value type.
fn infer_value_type(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::Array(_) => Some("set"),
        serde_json::Value::Object(_) => Some("map"),
        serde_json::Value::Number(_) => Some("counter"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::InMemoryBackend;

    fn synchronizer() -> (Arc<MemorySynchronizer>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let sync = MemorySynchronizer::new(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            WorkerId::new(),
            MemoryConfig::default(),
            EventBus::default(),
        );
        (sync, backend)
    }

    #[tokio::test]
    async fn test_read_your_writes_before_flush() {
        let (sync, backend) = synchronizer();

        sync.write("tasks/1/state", serde_json::json!("running"), WriteOptions::default())
            .unwrap();

        // Nothing flushed yet, but the pending buffer serves the read.
        assert!(backend.is_empty());
        assert_eq!(
            sync.read("tasks/1/state").await.unwrap(),
            Some(serde_json::json!("running"))
        );
    }

    #[tokio::test]
    async fn test_flush_lands_entries_and_caches() {
        let (sync, backend) = synchronizer();

        sync.write("tasks/1/state", serde_json::json!("running"), WriteOptions::default())
            .unwrap();
        let flushed = sync.flush().await;
        assert_eq!(flushed, 1);
        assert_eq!(backend.len(), 1);

        assert_eq!(
            sync.read("tasks/1/state").await.unwrap(),
            Some(serde_json::json!("running"))
        );
    }

    #[tokio::test]
    async fn test_delete_then_read_is_none() {
        let (sync, _backend) = synchronizer();

        sync.write("tasks/1/state", serde_json::json!("x"), WriteOptions::default())
            .unwrap();
        sync.flush().await;
        sync.delete("tasks/1/state").await.unwrap();

        assert_eq!(sync.read("tasks/1/state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_discards_pending_writes() {
        let (sync, backend) = synchronizer();

        sync.write("tasks/1/state", serde_json::json!("x"), WriteOptions::default())
            .unwrap();
        sync.delete("tasks/1/state").await.unwrap();
        sync.flush().await;

        assert!(backend.is_empty());
        assert_eq!(sync.read("tasks/1/state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writes_advance_clock_monotonically() {
        let (sync, _backend) = synchronizer();
        let local = sync.local_worker();

        let first = sync
            .write("a/b", serde_json::json!(1), WriteOptions::default())
            .unwrap();
        let second = sync
            .write("a/b", serde_json::json!(2), WriteOptions::default())
            .unwrap();

        assert!(second.clock.dominates(&first.clock));
        assert_eq!(second.clock.get(local), 2);
    }

    #[tokio::test]
    async fn test_subscription_fires_on_flush_for_matching_prefix() {
        let (sync, _backend) = synchronizer();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in_callback = Arc::clone(&seen);
        let id = sync.subscribe("tasks/", move |key, entry| {
            seen_in_callback
                .lock()
                .unwrap()
                .push((key.to_string(), entry.value.clone()));
        });

        sync.write("tasks/1/state", serde_json::json!("a"), WriteOptions::default())
            .unwrap();
        sync.write("workers/x/status", serde_json::json!("b"), WriteOptions::default())
            .unwrap();
        sync.flush().await;

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0, "tasks/1/state");
        }

        sync.unsubscribe(id);
        sync.write("tasks/2/state", serde_json::json!("c"), WriteOptions::default())
            .unwrap();
        sync.flush().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_remote_write_resolves_on_read() {
        let (sync, backend) = synchronizer();
        let remote_writer = WorkerId::new();

        // Local write flushed, then invalidated again by a second local
        // write that never lands (simulates a lost flush).
        sync.write("tasks/1/state", serde_json::json!({"a": 1}), WriteOptions::default())
            .unwrap();
        sync.flush().await;
        sync.write("tasks/1/state", serde_json::json!({"a": 1, "x": 9}), WriteOptions::default())
            .unwrap();
        {
            // Drop the pending entry behind the synchronizer's back so only
            // the invalidated cache line remains.
            let mut inner = sync.inner.lock().unwrap();
            inner.pending.clear();
        }

        // Remote worker writes a concurrent map entry directly.
        let mut remote_clock = VectorClock::new();
        remote_clock.increment(remote_writer);
        let remote_entry = MemoryEntry {
            value: serde_json::json!({"b": 2}),
            clock: remote_clock,
            timestamp: Utc::now() + chrono::Duration::seconds(1),
            owner: remote_writer,
            ttl_seconds: None,
        };
        backend
            .put(
                "tasks/1/state",
                &serde_json::to_string(&remote_entry).unwrap(),
                None,
            )
            .await
            .unwrap();

        // The invalidated cache line ({"a": 1}, clock {local: 1}) is
        // concurrent with the remote entry; shallow merge combines them.
        let resolved = sync.read("tasks/1/state").await.unwrap().unwrap();
        assert_eq!(resolved, serde_json::json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn test_resolve_candidates_emits_conflict_event() {
        let (sync, _backend) = synchronizer();
        let mut rx = sync.events.subscribe();

        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        let mut c1 = VectorClock::new();
        c1.increment(w1);
        let mut c2 = VectorClock::new();
        c2.increment(w2);

        let a = MemoryEntry {
            value: serde_json::json!({"a": 1}),
            clock: c1,
            timestamp: Utc::now(),
            owner: w1,
            ttl_seconds: None,
        };
        let b = MemoryEntry {
            value: serde_json::json!({"b": 2}),
            clock: c2,
            timestamp: Utc::now() + chrono::Duration::seconds(1),
            owner: w2,
            ttl_seconds: None,
        };

        let resolution = sync.resolve_candidates("tasks/9/state", Some("map"), vec![a, b]);
        assert_eq!(resolution.entry.value, serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(resolution.discarded.len(), 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), "conflict-resolved");
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_buffering() {
        let (sync, _backend) = synchronizer();
        assert!(sync
            .write("tasks/1|evil", serde_json::json!(1), WriteOptions::default())
            .is_err());
        assert!(sync.read("`cmd`").await.is_err());
    }
}
