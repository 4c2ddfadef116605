//! Cooperative stop signal shared by the publisher and subscriber loops.

use std::sync::Arc;
use tokio::sync::watch;

/// Sender half; `trigger` asks every loop holding a receiver to stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub fn is_stopped(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Resolves once a stop was requested. Never resolves if the sender is gone
/// without having asked for a stop.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let (shutdown, mut rx) = Shutdown::new();
        assert!(!is_stopped(&rx));

        let waiter = tokio::spawn(async move {
            stopped(&mut rx).await;
        });
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_stop() {
        let (shutdown, mut rx) = Shutdown::new();
        drop(shutdown);

        let result = tokio::time::timeout(Duration::from_millis(20), stopped(&mut rx)).await;
        assert!(result.is_err());
    }
}
