//! Keyed TTL cache over async loaders.
//!
//! A `FetchCache` is constructed once and shared (usually behind an `Arc`).
//! Every load for a key gets a generation number; starting a new load for the
//! same key cancels the previous one and only the current generation may
//! commit its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("load failed: {0}")]
    Load(String),
    /// The load was superseded by a newer one for the same key.
    #[error("load cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Cached(T),
    Loaded(T),
}

impl<T> Fetched<T> {
    pub fn into_value(self) -> T {
        match self {
            Fetched::Cached(v) | Fetched::Loaded(v) => v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Cancellation signal handed to a loader. Loaders should check it between
/// steps (or race `cancelled()`) and stop producing a result once it fires.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the load has been superseded.
    #[allow(dead_code)]
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                if *rx.borrow() {
                    return;
                }
                // Sender gone without cancelling: the load finished normally.
                std::future::pending::<()>().await;
            }
        }
    }
}

struct InFlight {
    generation: u64,
    cancel_tx: watch::Sender<bool>,
}

struct Inner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    inflight: HashMap<String, InFlight>,
    next_generation: u64,
}

pub struct FetchCache<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Default for FetchCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FetchCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored value for `key`, ignoring freshness.
    pub fn peek(&self, key: &str) -> Option<T> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn fresh(&self, key: &str, ttl: Duration) -> Option<T> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .filter(|e| e.is_fresh(now, ttl))
            .map(|e| e.value.clone())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    #[allow(dead_code)]
    pub fn is_loading(&self, key: &str) -> bool {
        self.lock().inflight.contains_key(key)
    }

    pub async fn get<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Fetched<T>, FetchError>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(v) = self.fresh(key, ttl) {
            debug!(key, "cache hit");
            return Ok(Fetched::Cached(v));
        }
        debug!(key, "cache miss");
        self.load(key, loader).await.map(Fetched::Loaded)
    }

    /// Evicts `key` and loads it again regardless of TTL.
    pub async fn refresh<F, Fut>(&self, key: &str, loader: F) -> Result<T, FetchError>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.invalidate(key);
        self.load(key, loader).await
    }

    async fn load<F, Fut>(&self, key: &str, loader: F) -> Result<T, FetchError>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let (generation, signal) = self.begin(key);
        let mut guard = InFlightGuard {
            cache: self,
            key,
            generation,
            armed: true,
        };
        let result = loader(signal).await;
        guard.armed = false;

        let mut inner = self.lock();
        let current = inner
            .inflight
            .get(key)
            .is_some_and(|f| f.generation == generation);
        if !current {
            debug!(key, generation, "discarding superseded load");
            return Err(FetchError::Cancelled);
        }
        inner.inflight.remove(key);

        match result {
            Ok(value) => {
                inner.entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(e) => Err(FetchError::Load(format!("{e:#}"))),
        }
    }

    fn begin(&self, key: &str) -> (u64, CancelSignal) {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (cancel_tx, rx) = watch::channel(false);
        if let Some(prev) = inner
            .inflight
            .insert(key.to_string(), InFlight { generation, cancel_tx })
        {
            debug!(key, superseded = prev.generation, "cancelling in-flight load");
            prev.cancel_tx.send_replace(true);
        }
        (generation, CancelSignal { rx })
    }
}

/// Clears the in-flight record of a load whose future was dropped before it
/// finished, unless a newer load has already replaced it.
struct InFlightGuard<'a, T: Clone> {
    cache: &'a FetchCache<T>,
    key: &'a str,
    generation: u64,
    armed: bool,
}

impl<T: Clone> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.cache.lock();
        if inner
            .inflight
            .get(self.key)
            .is_some_and(|f| f.generation == self.generation)
        {
            debug!(key = self.key, generation = self.generation, "load dropped");
            inner.inflight.remove(self.key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSnapshot<T> {
    pub data: Option<T>,
    #[allow(dead_code)]
    pub loading: bool,
    pub error: Option<String>,
}

/// One call site's view of a cached resource.
pub struct FetchCell<T> {
    cache: Arc<FetchCache<T>>,
    key: String,
    ttl: Duration,
    state: Mutex<FetchSnapshot<T>>,
}

impl<T: Clone> FetchCell<T> {
    pub fn new(cache: Arc<FetchCache<T>>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            key: key.into(),
            ttl,
            state: Mutex::new(FetchSnapshot {
                data: None,
                loading: false,
                error: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    #[allow(dead_code)]
    pub fn snapshot(&self) -> FetchSnapshot<T> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn load<F, Fut>(&self, loader: F) -> FetchSnapshot<T>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.set_loading();
        let result = self
            .cache
            .get(&self.key, self.ttl, loader)
            .await
            .map(Fetched::into_value);
        self.settle(result)
    }

    pub async fn refresh<F, Fut>(&self, loader: F) -> FetchSnapshot<T>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.set_loading();
        let result = self.cache.refresh(&self.key, loader).await;
        self.settle(result)
    }

    fn set_loading(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.loading = true;
    }

    fn settle(&self, result: Result<T, FetchError>) -> FetchSnapshot<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(v) => {
                state.data = Some(v);
                state.error = None;
                state.loading = false;
            }
            Err(FetchError::Load(message)) => {
                state.error = Some(message);
                state.loading = false;
            }
            // Superseded: show whatever the winning load committed, no error.
            Err(FetchError::Cancelled) => {
                if let Some(v) = self.cache.peek(&self.key) {
                    state.data = Some(v);
                }
                state.loading = false;
            }
        }
        state.clone()
    }
}
