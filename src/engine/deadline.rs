//! Per-direction I/O deadlines.
//!
//! A deadline is a `(generation, wake-at, notification channel)` triple.
//! Setting a new deadline bumps the generation and publishes it on a watch
//! channel; in-flight waiters subscribe per select round, so replacing the
//! deadline mid-operation atomically retargets the wake. Waiters sleep on
//! the wake instant themselves; there is no detached timer task to race
//! against.

use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

pub(crate) struct Deadline {
    inner: Mutex<Inner>,
}

struct Inner {
    generation: u64,
    wake_at: Option<Instant>,
    tx: watch::Sender<u64>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                generation: 0,
                wake_at: None,
                tx,
            }),
        }
    }

    /// Replaces the deadline. `None` disarms; an instant in the past fires
    /// waiters immediately.
    pub(crate) fn set(&self, wake_at: Option<Instant>) {
        let mut inner = self.lock();
        inner.generation = inner.generation.wrapping_add(1);
        inner.wake_at = wake_at;
        let generation = inner.generation;
        let _ = inner.tx.send(generation);
    }

    /// Snapshot of the current wake time plus a receiver that fires when
    /// the deadline is replaced. Subscribing happens under the same lock as
    /// `set`, so no replacement can slip between the snapshot and the
    /// subscription.
    pub(crate) fn observe(&self) -> (Option<Instant>, watch::Receiver<u64>) {
        let inner = self.lock();
        (inner.wake_at, inner.tx.subscribe())
    }

    /// Deadline state stays usable even if a holder panicked; there is no
    /// invariant here that poisoning should protect.
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn replacement_wakes_observers() {
        let d = Deadline::new();
        let (wake, mut rx) = d.observe();
        assert!(wake.is_none());

        d.set(Some(Instant::now() + Duration::from_secs(60)));
        rx.changed().await.unwrap();

        let (wake, _) = d.observe();
        assert!(wake.is_some());
    }

    #[tokio::test]
    async fn disarm_clears_wake_time() {
        let d = Deadline::new();
        d.set(Some(Instant::now()));
        d.set(None);
        let (wake, _) = d.observe();
        assert!(wake.is_none());
    }

    #[tokio::test]
    async fn each_set_bumps_generation() {
        let d = Deadline::new();
        let (_, rx) = d.observe();
        let first = *rx.borrow();
        d.set(None);
        d.set(None);
        let (_, rx) = d.observe();
        assert_eq!(*rx.borrow(), first + 2);
    }
}
