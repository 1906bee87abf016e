//! Single-assignment, multi-observer signal.
//!
//! A latch is fired at most once. Any number of observers can wait on it,
//! before or after it fires, and all of them see the same value.

use std::fmt;
use std::future::Future;

use tokio::sync::watch;

pub struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> Latch<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Fire the latch. Returns `false` if it had already fired, in which case
    /// `value` is dropped and observers keep the first value.
    pub fn fire(&self, value: T) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The fired value, if any.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the latch to fire.
    ///
    /// The returned future does not borrow the latch. It resolves to `None`
    /// only if the latch is dropped without ever firing.
    pub fn wait(&self) -> impl Future<Output = Option<T>> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            match rx.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            }
        }
    }
}

impl<T> Default for Latch<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Latch").field(&*self.tx.borrow()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_once_for_every_observer() {
        let latch = Latch::new();
        let early = latch.wait();
        let waiters: Vec<_> = (0..3).map(|_| tokio::spawn(latch.wait())).collect();
        assert!(!latch.is_fired());

        assert!(latch.fire("first"));
        assert!(latch.is_fired());
        assert!(!latch.fire("second"));

        assert_eq!(early.await, Some("first"));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Some("first"));
        }
        // Late observers resolve immediately.
        assert_eq!(latch.wait().await, Some("first"));
        assert_eq!(latch.get(), Some("first"));
    }

    #[tokio::test]
    async fn dropped_latch_releases_waiters() {
        let latch: Latch<u8> = Latch::new();
        let waiter = latch.wait();
        drop(latch);
        let result = tokio::time::timeout(Duration::from_millis(50), waiter).await;
        assert_eq!(result, Ok(None));
    }
}
