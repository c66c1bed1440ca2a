//! Cancellation signalling between the orchestrator, runners and consumers.

use tokio::sync::watch;

/// Create a linked cancellation source/token pair.
pub fn channel() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

/// The firing half. Cancels explicitly via [`CancelSource::cancel`] or
/// implicitly when dropped, so holding it in a scope behaves like a
/// deferred cancel.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// The observing half. Cheap to clone; every clone sees the signal, even
/// ones created after it fired.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires. Useful for one-shot commands that only
    /// need a timeout.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();
        NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // Keep the sender alive so the channel never closes.
                std::mem::forget(tx);
                CancelToken { rx }
            })
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the source fires. Pending forever on a token from
    /// [`CancelToken::never`].
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Source dropped: Drop fired the signal first, so the next
                // borrow observes it; an error here only happens for
                // forged never-tokens.
                std::future::pending::<()>().await;
            }
        }
    }
}
