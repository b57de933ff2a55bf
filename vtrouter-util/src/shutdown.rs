//! A cloneable shutdown signal: every outstanding [`ShutdownReceiver`] must
//! be dropped (or observe the signal) before [`ShutdownSender::shutdown_timeout`]
//! resolves, so a caller can know every background task has actually wound
//! down rather than merely been told to.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

struct Shared {
    outstanding: AtomicUsize,
    notify: tokio::sync::Notify,
}

pub struct ShutdownSender {
    tx: watch::Sender<bool>,
    shared: Arc<Shared>,
}

pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        outstanding: AtomicUsize::new(1),
        notify: tokio::sync::Notify::new(),
    });
    (
        ShutdownSender {
            tx,
            shared: shared.clone(),
        },
        ShutdownReceiver { rx, shared },
    )
}

impl Clone for ShutdownReceiver {
    fn clone(&self) -> Self {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        ShutdownReceiver {
            rx: self.rx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for ShutdownReceiver {
    fn drop(&mut self) {
        if self.shared.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.notify.notify_waiters();
        }
    }
}

impl ShutdownReceiver {
    /// Resolves once the sender signals shutdown. Safe to call repeatedly.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

impl ShutdownSender {
    /// Signals shutdown, then waits for every outstanding `ShutdownReceiver`
    /// (including clones) to be dropped, up to `timeout_dur`.
    pub async fn shutdown_timeout(self, timeout_dur: Duration) {
        let _ = self.tx.send(true);
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        let wait = async {
            loop {
                // Register interest before checking the count, or a drop
                // landing between the check and the await would notify
                // nobody and this would wait out the full timeout.
                let notified = self.shared.notify.notified();
                if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        let _ = timeout(timeout_dur, wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_resolves_after_shutdown_sent() {
        let (tx, mut rx) = channel();
        let mut rx2 = rx.clone();
        let task = tokio::spawn(async move {
            rx.recv().await;
            rx2.recv().await;
        });
        tx.shutdown_timeout(Duration::from_secs(1)).await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_clones_to_drop() {
        let (tx, rx) = channel();
        let rx2 = rx.clone();
        drop(rx);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(rx2);
        });
        tx.shutdown_timeout(Duration::from_secs(1)).await;
        task.await.unwrap();
    }
}
