//! Single-flight coordination for identical cache misses
//!
//! For a given cache key, at most one compute (upstream fetch + transform +
//! write-back) is in flight at any instant. Callers that arrive while a
//! flight is running block until it finishes and share its result. The
//! compute runs on a detached task, so a waiter dropping out never cancels
//! work that others depend on.

use crate::error::ProxyError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Shared outcome of one flight
pub type FlightResult<T> = std::result::Result<T, Arc<ProxyError>>;

type FlightMap<T> = Arc<Mutex<HashMap<String, broadcast::Sender<FlightResult<T>>>>>;

/// Coalesces concurrent identical misses into one shared compute
pub struct SingleFlight<T: Clone + Send + 'static> {
    inflight: FlightMap<T>,
    started: AtomicU64,
    coalesced: AtomicU64,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Run `compute` for `key`, or join the flight already running for it.
    ///
    /// The handle is removed before the result is broadcast, so a caller
    /// arriving after completion starts a fresh flight (and will normally
    /// hit the cache the finished flight populated).
    pub async fn run<F>(&self, key: &str, compute: F) -> FlightResult<T>
    where
        F: Future<Output = std::result::Result<T, ProxyError>> + Send + 'static,
    {
        let mut receiver = {
            let mut inflight = self.inflight.lock().await;
            if let Some(sender) = inflight.get(key) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "joined in-flight fetch");
                sender.subscribe()
            } else {
                let (sender, receiver) = broadcast::channel(1);
                inflight.insert(key.to_string(), sender.clone());
                self.started.fetch_add(1, Ordering::Relaxed);

                let map = Arc::clone(&self.inflight);
                let key = key.to_string();
                tokio::spawn(async move {
                    let outcome = compute.await.map_err(Arc::new);
                    map.lock().await.remove(&key);
                    // No receivers left is fine; the cache already has the
                    // result if the compute succeeded
                    let _ = sender.send(outcome);
                });
                receiver
            }
        };

        match receiver.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(Arc::new(ProxyError::Internal(
                "in-flight fetch was abandoned".to_string(),
            ))),
        }
    }

    /// Flights launched (leaders)
    pub fn flights_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that joined an existing flight
    pub fn flights_coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_compute() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flight
                    .run("tournaments:abc", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("body".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.unwrap(), "body");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.flights_started(), 1);
        assert_eq!(flight.flights_coalesced(), 99);
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let flight = Arc::new(SingleFlight::<String>::new());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flight = Arc::clone(&flight);
            handles.push(tokio::spawn(async move {
                flight
                    .run("rankings:def", async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(ProxyError::UpstreamUnavailable("down".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(matches!(
                outcome.unwrap_err().as_ref(),
                ProxyError::UpstreamUnavailable(_)
            ));
        }
        assert_eq!(flight.flights_started(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let a = flight.run("key-a", async { Ok(1) });
        let b = flight.run("key-b", async { Ok(2) });
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(flight.flights_started(), 2);
        assert_eq!(flight.flights_coalesced(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_start_new_flights() {
        let flight = SingleFlight::<u32>::new();

        assert_eq!(flight.run("k", async { Ok(1) }).await.unwrap(), 1);
        assert_eq!(flight.run("k", async { Ok(2) }).await.unwrap(), 2);
        assert_eq!(flight.flights_started(), 2);
    }

    #[tokio::test]
    async fn test_waiter_cancellation_does_not_cancel_compute() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let completed = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flight = Arc::clone(&flight);
            let completed = Arc::clone(&completed);
            tokio::spawn(async move {
                flight
                    .run("k", async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok("done".to_string())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        // The leader's request is dropped mid-flight
        leader.abort();

        // A late joiner still gets the shared result
        let outcome = flight
            .run("k", async { Ok("should not run".to_string()) })
            .await
            .unwrap();
        assert_eq!(outcome, "done");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
