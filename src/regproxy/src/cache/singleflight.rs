//! Deduplicate concurrent work by key.
//!
//! The first caller for a key runs the work in its own task; callers arriving
//! while it runs subscribe to the same broadcast and receive its result.

use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

type Shared<T> = Arc<Result<T>>;
type InFlight<T> = Arc<Mutex<HashMap<String, broadcast::Sender<Shared<T>>>>>;

pub struct SingleFlight<T> {
    in_flight: InFlight<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run `work` for `key` unless it is already running, then wait for the
    /// shared result. The work is not cancelled if this caller goes away.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (mut rx, leader) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.entry(key.to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    (entry.get().subscribe(), None)
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let (tx, rx) = broadcast::channel(1);
                    entry.insert(tx.clone());
                    (rx, Some(tx))
                }
            }
        };

        if let Some(tx) = leader {
            let key = key.to_string();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                // Inner task so a panic still reaches the waiters as an error
                let result = match tokio::spawn(work()).await {
                    Ok(result) => result,
                    Err(e) => Err(ProxyError::Cache(format!("Deduplicated task failed: {}", e))),
                };
                // Remove and publish under the lock: late subscribers either
                // see this result or start fresh work.
                let mut in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.remove(&key);
                let _ = tx.send(Arc::new(result));
            });
        } else {
            tracing::debug!(key = %key, "Waiting for in-flight request");
        }

        match rx.recv().await {
            Ok(shared) => match Arc::try_unwrap(shared) {
                Ok(result) => result,
                Err(shared) => match shared.as_ref() {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => Err(e.duplicate()),
                },
            },
            Err(e) => Err(ProxyError::Cache(format!("In-flight channel error: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("key", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_reach_every_waiter() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let a = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(ProxyError::UpstreamNotFound("gone".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = flight.run("k", || async { Ok(1) }).await;

        assert!(matches!(a.await.unwrap(), Err(ProxyError::UpstreamNotFound(_))));
        assert!(matches!(b, Err(ProxyError::UpstreamNotFound(_))));
    }
}
