//! Cooperative shutdown token.
//!
//! Every long-lived task holds a [`Shutdown`] and selects against
//! [`Shutdown::triggered`] at each sleep, queue wait, and I/O boundary.

use tokio::sync::watch;

pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// Held by the supervisor (main). Triggering is idempotent.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered. Also resolves if the handle is
    /// dropped, so a lost supervisor never leaves tasks running.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_resolves_waiters() {
        let (handle, mut shutdown) = channel();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(async move {
            shutdown.triggered().await;
            true
        });
        handle.trigger();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_triggered() {
        let (handle, mut shutdown) = channel();
        drop(handle);
        shutdown.triggered().await;
    }
}
