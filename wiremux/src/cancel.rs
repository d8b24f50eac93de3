//! Cooperative cancellation.
//!
//! A [`CancelSource`] fires at most once; every [`CancelToken`] cloned
//! from it observes the fire. Cancellation is advisory: a handler holding
//! a token may complete anyway, and callers must only rely on their own
//! future settling.

use tokio::sync::watch;

pub struct CancelSource {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for tokens created without a source, so
    // `cancelled()` stays pending instead of resolving on channel close.
    _keep: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelSource {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);

        (CancelSource { tx }, CancelToken { rx, _keep: None })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            _keep: None,
        }
    }
}

impl CancelToken {
    /// A token that never fires, for callers without a cancellation path.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);

        CancelToken {
            rx,
            _keep: Some(std::sync::Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the source fires. A source dropped without firing can
    /// never cancel any more, so the future stays pending in that case.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();

        let result = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !result {
            std::future::pending().await
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken {{ cancelled: {} }}", self.is_cancelled())
    }
}
