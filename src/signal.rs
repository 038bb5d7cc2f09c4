//! The one-shot "resolved" rendezvous used by `Init`/`Closing` remote states
//! (spec.md §3, §9; INV-RESOLVE-ONCE). Built on `tokio::sync::watch` so an
//! unbounded number of waiters can observe a fire that may have already
//! happened before they started waiting; a plain `Notify` would lose that
//! wakeup.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::time::{timeout, Duration};

#[derive(Debug)]
pub(crate) struct ResolveSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ResolveSignal {
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        ResolveSignal {
            fired: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    /// Fires the signal. INV-RESOLVE-ONCE: subsequent calls are no-ops, but
    /// callers still must publish the new state before calling this.
    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(true);
        }
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// As [`Self::wait`], but gives up after `bound` (spec.md §4.10 /
    /// Open Question (a)): an inbound `Crossed` peer that dies before
    /// publishing `Valid` would otherwise block the outbound waiter forever.
    pub(crate) async fn wait_bounded(&self, bound: Duration) -> bool {
        timeout(bound, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fire_before_wait_is_observed() {
        let signal = Arc::new(ResolveSignal::new());
        signal.fire();
        signal.wait().await;
    }

    #[tokio::test]
    async fn wait_unblocks_when_fired_concurrently() {
        let signal = Arc::new(ResolveSignal::new());
        let s2 = signal.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s2.fire();
        });
        signal.wait().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_bounded_times_out_if_never_fired() {
        let signal = ResolveSignal::new();
        let resolved = signal.wait_bounded(Duration::from_millis(20)).await;
        assert!(!resolved);
    }
}
