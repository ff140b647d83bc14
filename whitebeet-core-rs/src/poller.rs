//! Background poller for unsolicited frames

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::{stop_pair, StopHandle};
use crate::exchange::{Exchange, PollOutcome};

/// Owns the `whitebeet-poller` thread
#[derive(Debug)]
pub struct Poller {
    stop: StopHandle,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl Poller {
    /// Start polling `exchange` at its configured cadence
    pub fn spawn(exchange: Exchange) -> std::io::Result<Self> {
        let (stop, token) = stop_pair();
        let interval = exchange.config().poll_interval;
        let join_timeout = exchange.config().stop_join_timeout;

        let handle = std::thread::Builder::new()
            .name("whitebeet-poller".to_string())
            .spawn(move || {
                info!("Poller started ({:?} cadence)", interval);
                let mut busy = 0u64;
                while !token.is_stopped() {
                    if exchange.poll_once() == PollOutcome::Busy {
                        busy += 1;
                    }
                    if !token.sleep(interval) {
                        break;
                    }
                }
                debug!("Poller skipped {} busy cycles", busy);
                info!("Poller stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
            join_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and join it within the configured bound.
    ///
    /// Returns `false` if the thread did not finish in time; it is then
    /// detached and exits on its own after its current cycle.
    pub fn stop(&mut self) -> bool {
        self.stop.stop();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Poller did not stop within {:?}, detaching", self.join_timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if handle.join().is_err() {
            warn!("Poller thread panicked");
        }
        true
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}
