//! Single-flight proxy loader.
//!
//! Collapses concurrent loads for the same key into one call against the
//! underlying source and fans the result out to every caller, while the
//! [`Gate`] caps how many loads run at once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::gate::Gate;

/// Capability that performs the actual load.
///
/// The loader treats it as a black box: it may be slow, it may fail, and
/// no idempotence is assumed beyond "safe to call once per episode". It
/// is never invoked more than once concurrently for the same key.
#[async_trait]
pub trait ProxyLoad: Send + Sync {
    /// Load the value for `key`. The `bool` is the success flag; a
    /// `false` result is an ordinary outcome, not an error.
    async fn load(&self, key: &str) -> (Bytes, bool);
}

/// Snapshot of the loader for monitoring.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderStatus {
    /// Gate capacity ceiling.
    pub max_concurrency: usize,
    /// Loads currently admitted by the gate.
    pub current_concurrency: usize,
    /// Distinct keys with a load outstanding.
    pub in_flight_keys: usize,
}

#[derive(Debug, Clone)]
struct Outcome {
    value: Bytes,
    ok: bool,
}

/// One in-flight episode for a key. The watch value moves from `None` to
/// `Some` exactly once, after the outcome is fully written; waiters only
/// ever read it through that transition.
struct Flight {
    done: watch::Sender<Option<Outcome>>,
}

enum Entry {
    Waiter(watch::Receiver<Option<Outcome>>),
    Owner(Arc<Flight>),
}

/// Deduplicating, concurrency-bounded loader.
///
/// While a load for a key is outstanding, every additional `load` call
/// for that key attaches to the in-flight result instead of hitting the
/// source again. Nothing is retained once the episode completes: a later
/// call for the same key starts a fresh load.
pub struct Loader {
    source: Arc<dyn ProxyLoad>,
    gate: Gate,
    in_flight: Mutex<HashMap<String, Arc<Flight>>>,
}

impl Loader {
    /// Create a loader over `source`, admitting at most `max_concurrent`
    /// simultaneous loads.
    pub fn new(source: Arc<dyn ProxyLoad>, max_concurrent: usize) -> Self {
        Self {
            source,
            gate: Gate::new(max_concurrent),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Load the value for `key`, collapsing into an in-flight load for
    /// the same key if one exists.
    pub async fn load(&self, key: &str) -> (Bytes, bool) {
        let entry = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(flight) => Entry::Waiter(flight.done.subscribe()),
                None => {
                    let (done, _) = watch::channel(None);
                    let flight = Arc::new(Flight { done });
                    in_flight.insert(key.to_owned(), Arc::clone(&flight));
                    Entry::Owner(flight)
                }
            }
        };

        match entry {
            Entry::Waiter(mut done) => {
                tracing::debug!(key, "attaching to in-flight load");
                match done.wait_for(|outcome| outcome.is_some()).await {
                    Ok(outcome) => {
                        let Outcome { value, ok } =
                            outcome.clone().expect("value checked by wait_for");
                        (value, ok)
                    }
                    Err(_) => {
                        // The owner went away without publishing a result
                        // (its load panicked). Deliver a failed outcome
                        // rather than hanging.
                        tracing::warn!(key, "in-flight load ended without a result");
                        (Bytes::new(), false)
                    }
                }
            }
            Entry::Owner(flight) => self.load_owned(key, &flight).await,
        }
    }

    /// Owner path: perform the one load for this episode.
    async fn load_owned(&self, key: &str, flight: &Flight) -> (Bytes, bool) {
        // Removes the table entry on every exit path. If the source
        // panics, dropping the entry (and then the owner's Flight handle)
        // closes the watch channel, so waiters wake up regardless.
        let _cleanup = FlightCleanup { loader: self, key };

        let permit = self.gate.acquire().await;
        tracing::debug!(key, "loading");
        let (value, ok) = self.source.load(key).await;
        drop(permit);

        // Publish before _cleanup removes the entry: a caller that found
        // this flight in the table must observe the outcome.
        flight.done.send_replace(Some(Outcome {
            value: value.clone(),
            ok,
        }));
        (value, ok)
    }

    /// Permanently reduce the maximum concurrency by one. See
    /// [`Gate::request_shrink`].
    pub fn request_shrink(&self) {
        self.gate.request_shrink();
    }

    /// Snapshot of gate occupancy and in-flight keys.
    pub fn status(&self) -> LoaderStatus {
        // Lock order: table first, then gate state. Any future path that
        // needs both must keep this order.
        let in_flight = self.in_flight.lock();
        let gate = self.gate.status();
        LoaderStatus {
            max_concurrency: gate.max_capacity,
            current_concurrency: gate.in_use,
            in_flight_keys: in_flight.len(),
        }
    }
}

struct FlightCleanup<'a> {
    loader: &'a Loader,
    key: &'a str,
}

impl Drop for FlightCleanup<'_> {
    fn drop(&mut self) {
        self.loader.in_flight.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        ok: bool,
    }

    impl CountingSource {
        fn new(ok: bool) -> Self {
            Self { calls: AtomicUsize::new(0), ok }
        }
    }

    #[async_trait]
    impl ProxyLoad for CountingSource {
        async fn load(&self, key: &str) -> (Bytes, bool) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (Bytes::from(format!("value:{key}")), self.ok)
        }
    }

    #[tokio::test]
    async fn test_load_returns_source_value() {
        let source = Arc::new(CountingSource::new(true));
        let loader = Loader::new(Arc::clone(&source) as Arc<dyn ProxyLoad>, 4);

        let (value, ok) = loader.load("proxy-a").await;
        assert!(ok);
        assert_eq!(value, Bytes::from("value:proxy-a"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_loads_are_independent_episodes() {
        let source = Arc::new(CountingSource::new(true));
        let loader = Loader::new(Arc::clone(&source) as Arc<dyn ProxyLoad>, 4);

        let _ = loader.load("k").await;
        let _ = loader.load("k").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_retried_within_episode() {
        let source = Arc::new(CountingSource::new(false));
        let loader = Loader::new(Arc::clone(&source) as Arc<dyn ProxyLoad>, 4);

        let (_, ok) = loader.load("k").await;
        assert!(!ok);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // A fresh call after completion hits the source again
        let (_, ok) = loader.load("k").await;
        assert!(!ok);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_status() {
        let loader = Loader::new(Arc::new(CountingSource::new(true)), 3);
        let status = loader.status();
        assert_eq!(status.max_concurrency, 3);
        assert_eq!(status.current_concurrency, 0);
        assert_eq!(status.in_flight_keys, 0);
    }

    #[tokio::test]
    async fn test_request_shrink_reduces_max_concurrency() {
        let loader = Loader::new(Arc::new(CountingSource::new(true)), 3);
        loader.request_shrink();
        assert_eq!(loader.status().max_concurrency, 2);
    }

    #[tokio::test]
    async fn test_status_serializes_camel_case() {
        let loader = Loader::new(Arc::new(CountingSource::new(true)), 3);
        let json = serde_json::to_value(loader.status()).expect("serialize");
        assert_eq!(json["maxConcurrency"], 3);
        assert_eq!(json["currentConcurrency"], 0);
        assert_eq!(json["inFlightKeys"], 0);
    }
}
