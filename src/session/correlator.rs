//! Matches responses to the requests that caused them.
//!
//! Each request gets the next identity from a per-session counter starting
//! at 1 and a [`Deferred`] parked under that identity. A response settles
//! whichever request carries its identity, in any order. Once the correlator
//! is closed, new requests fail immediately with the closing reason.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::deferred::Deferred;
use crate::error::BrokerError;

struct Inner<T> {
    next_id: u64,
    pending: HashMap<u64, Deferred<T>>,
    closed: Option<BrokerError>,
}

pub struct Correlator<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Correlator<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next identity and park a deferred under it.
    pub fn allocate(&self) -> Result<(u64, Deferred<T>), BrokerError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(reason.clone());
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let deferred = Deferred::new();
        inner.pending.insert(id, deferred.clone());
        Ok((id, deferred))
    }

    /// Settle the request with this identity. Unknown or already-settled
    /// identities are ignored and return `false`.
    pub fn resolve(&self, id: u64, value: T) -> bool {
        match self.take(id) {
            Some(deferred) => deferred.resolve(value),
            None => false,
        }
    }

    pub fn reject(&self, id: u64, error: BrokerError) -> bool {
        match self.take(id) {
            Some(deferred) => deferred.reject(error),
            None => false,
        }
    }

    fn take(&self, id: u64) -> Option<Deferred<T>> {
        self.lock().pending.remove(&id)
    }

    /// Reject everything still pending and refuse new requests. Returns how
    /// many requests were rejected; a second close rejects nothing.
    pub fn close(&self, reason: BrokerError) -> usize {
        let drained: Vec<Deferred<T>> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.pending.drain().map(|(_, d)| d).collect()
        };
        drained
            .into_iter()
            .filter(|deferred| deferred.reject(reason.clone()))
            .count()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Allocate an identity, hand it to `send`, and wait for the matching
    /// outcome. The timeout covers the send and the wait together. A failed
    /// send or an expired timeout removes the entry, so a late response for
    /// that identity is ignored.
    pub async fn issue<F, Fut>(
        &self,
        send: F,
        timeout: Option<Duration>,
    ) -> Result<(u64, T), BrokerError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let (id, deferred) = self.allocate()?;

        let exchange = async {
            if let Err(e) = send(id).await {
                self.reject(id, e.clone());
                return Err(e);
            }
            deferred.wait().await
        };

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.reject(
                        id,
                        BrokerError::TimedOut {
                            what: "request",
                            after,
                        },
                    );
                    // A response or cleanup may have settled it first.
                    deferred.wait().await
                }
            },
            None => exchange.await,
        };
        outcome.map(|value| (id, value))
    }
}
