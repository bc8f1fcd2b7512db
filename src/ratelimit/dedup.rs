//! Collapses concurrent identical requests into one in-flight call

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::debug;

use crate::providers::ProviderError;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, ProviderError>>>;

struct Pending<T: Clone> {
    generation: u64,
    call: SharedCall<T>,
    /// Callers currently awaiting `call`
    waiters: usize,
}

type PendingMap<T> = Mutex<HashMap<String, Pending<T>>>;

/// Releases one caller's hold on an entry when that caller finishes or is dropped
///
/// The entry goes away once the call settles or once no caller is left to
/// await it, whichever comes first.
struct WaiterGuard<'a, T: Clone> {
    pending: &'a PendingMap<T>,
    key: String,
    generation: u64,
    settled: bool,
}

impl<T: Clone> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let remove = match pending.get_mut(&self.key) {
            Some(entry) if entry.generation == self.generation => {
                entry.waiters = entry.waiters.saturating_sub(1);
                self.settled || entry.waiters == 0
            }
            _ => false,
        };
        if remove {
            pending.remove(&self.key);
            if !self.settled {
                debug!(key = %self.key, "In-flight request abandoned by every caller");
            }
        }
    }
}

/// Map of in-flight calls keyed by request identity
///
/// Callers that arrive while a call with the same key is running await the
/// same shared future. The entry is removed as soon as the call settles, or
/// when every caller awaiting it has been dropped, so the next caller
/// triggers a fresh request.
pub struct Deduplicator<T: Clone> {
    pending: PendingMap<T>,
    generation: AtomicU64,
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Runs `call` unless an identical call is already in flight
    ///
    /// `call` is dropped unpolled when the caller joins an existing entry.
    pub async fn run<F>(&self, key: impl Into<String>, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        let key = key.into();

        let (generation, shared) = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get_mut(&key) {
                Some(entry) if entry.call.peek().is_none() => {
                    debug!(key = %key, "Joining in-flight request");
                    entry.waiters += 1;
                    (entry.generation, entry.call.clone())
                }
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let shared = call.boxed().shared();
                    pending.insert(
                        key.clone(),
                        Pending {
                            generation,
                            call: shared.clone(),
                            waiters: 1,
                        },
                    );
                    (generation, shared)
                }
            }
        };

        let mut guard = WaiterGuard {
            pending: &self.pending,
            key,
            generation,
            settled: false,
        };
        let result = shared.await;
        guard.settled = true;
        result
    }

    /// Number of calls currently in flight
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Drops every entry; running calls finish for callers already awaiting them
    pub fn reset(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl<T> Default for Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
