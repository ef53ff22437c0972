use std::future::Future;
use tokio::sync::watch;

/// Creates the run-wide stop signal: one raising handle, any number of
/// observers.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Raise the signal. Raising it again is a no-op.
    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised. Also resolves if the handle is
    /// gone, since nothing could raise it any more.
    pub async fn raised(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }

    /// Drive `fut` unless the signal fires first; `None` means it fired.
    pub async fn guard<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        if self.is_raised() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.raised() => None,
            out = fut => Some(out),
        }
    }

    /// Sleep for `duration`; returns `false` if the signal cut the sleep short.
    pub async fn sleep(&mut self, duration: std::time::Duration) -> bool {
        self.guard(tokio::time::sleep(duration)).await.is_some()
    }
}
