//! Cooperative cancellation shared by the poller and the session loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Longest uninterrupted sleep inside `StopToken::sleep`
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Requests a stop; cloneable, any clone may fire it
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes a stop request at suspension points
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair
pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopToken { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Another token observing this handle
    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns `false` when the sleep was cut short by a stop request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Wait asynchronously until a stop is requested
    pub async fn stopped(&mut self) {
        // an error means every handle is gone, nobody can stop us anymore
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
