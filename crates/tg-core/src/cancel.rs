use tokio::sync::watch;

/// Owner side of a cancellation flag.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side, cloned into every suspension point of a job.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token nobody can cancel.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
