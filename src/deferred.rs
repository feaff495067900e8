//! One-shot, idempotent async completion.
//!
//! A [`Deferred`] is settled at most once: the first `resolve` or `reject`
//! wins and every later call is ignored. Any number of tasks may
//! [`wait`](Deferred::wait) on it, from any thread, before or after it settles.
//! Built on [`tokio::sync::watch`] so the settle transition is a single
//! atomic check-and-set on the channel's value.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::BrokerError;

type Slot<T> = Option<Result<T, BrokerError>>;

pub struct Deferred<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.tx.borrow().is_some())
            .finish()
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn reject(&self, error: BrokerError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The outcome, if settled, without waiting.
    pub fn peek(&self) -> Option<Result<T, BrokerError>> {
        self.tx.borrow().clone()
    }

    /// Wait for the outcome. Every waiter observes the same one.
    pub async fn wait(&self) -> Result<T, BrokerError> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => match &*slot {
                Some(outcome) => outcome.clone(),
                None => Err(BrokerError::Channel("deferred woke without an outcome".into())),
            },
            // The sender lives in `self`, so the channel cannot close under us.
            Err(_) => Err(BrokerError::Channel("deferred dropped before settling".into())),
        }
    }

    fn settle(&self, outcome: Result<T, BrokerError>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_then_wait() {
        let d = Deferred::new();
        assert!(d.resolve(7));
        assert_eq!(d.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn wait_before_resolve() {
        let d: Deferred<String> = Deferred::new();
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        d.resolve("hello".to_string());
        assert_eq!(waiter.await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn second_settle_is_ignored() {
        let orderings: [&[bool]; 4] = [
            &[true, true],
            &[true, false],
            &[false, true],
            &[false, false],
        ];
        for calls in orderings {
            let d = Deferred::new();
            let first_is_resolve = calls[0];
            for (i, &resolve) in calls.iter().enumerate() {
                let changed = if resolve {
                    d.resolve(i)
                } else {
                    d.reject(BrokerError::Destroyed)
                };
                assert_eq!(changed, i == 0);
            }
            match d.wait().await {
                Ok(v) => {
                    assert!(first_is_resolve);
                    assert_eq!(v, 0);
                }
                Err(e) => {
                    assert!(!first_is_resolve);
                    assert_eq!(e, BrokerError::Destroyed);
                }
            }
        }
    }

    #[tokio::test]
    async fn all_waiters_see_same_outcome() {
        let d: Deferred<u64> = Deferred::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.wait().await })
            })
            .collect();
        d.reject(BrokerError::TerminatedUnexpectedly);
        d.resolve(1);
        for w in waiters {
            assert_eq!(
                w.await.unwrap().unwrap_err(),
                BrokerError::TerminatedUnexpectedly
            );
        }
    }

    #[test]
    fn settled_flag_and_peek() {
        let d: Deferred<()> = Deferred::new();
        assert!(!d.is_settled());
        assert!(d.peek().is_none());
        d.resolve(());
        assert!(d.is_settled());
        assert_eq!(d.peek(), Some(Ok(())));
    }

    #[tokio::test]
    async fn settle_from_another_thread() {
        let d: Deferred<i32> = Deferred::new();
        let remote = d.clone();
        std::thread::spawn(move || {
            remote.resolve(42);
        })
        .join()
        .unwrap();
        assert_eq!(d.wait().await.unwrap(), 42);
    }
}
