//! Round timers for QBFT instances.
//!
//! Each armed timer is a tokio task that sleeps for the round timeout and
//! then posts a `Timeout` command into the controller mailbox. Timers hold
//! only the mailbox sender plus `(height, round)` — never a reference into
//! instance state — and the instance drops fires whose round no longer
//! matches its current round.

use crate::controller::ControllerCommand;
use dv_types::{Height, Round};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Rounds up to and including this threshold use the quick timeout.
pub const QUICK_TIMEOUT_THRESHOLD: Round = 8;
pub const QUICK_TIMEOUT: Duration = Duration::from_secs(2);
pub const SLOW_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for a given round: exponential progress is expected early, so the
/// first eight rounds are quick; after that rounds are long to let a
/// partitioned committee reconverge.
pub fn round_timeout(round: Round) -> Duration {
    if round <= QUICK_TIMEOUT_THRESHOLD {
        QUICK_TIMEOUT
    } else {
        SLOW_TIMEOUT
    }
}

/// Manages the active round timer of each running instance.
///
/// At most one timer is armed per height; arming a new round replaces the
/// previous task. `stop` is idempotent.
pub struct RoundTimers {
    timers: HashMap<Height, JoinHandle<()>>,
    mailbox: mpsc::Sender<ControllerCommand>,
}

impl RoundTimers {
    pub fn new(mailbox: mpsc::Sender<ControllerCommand>) -> Self {
        RoundTimers {
            timers: HashMap::new(),
            mailbox,
        }
    }

    /// Arm the timer for `round` of the instance at `height`, replacing any
    /// previously armed timer for that height.
    pub fn start(&mut self, height: Height, round: Round) {
        self.stop(height);

        let mailbox = self.mailbox.clone();
        let timeout = round_timeout(round);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!(height, round, "round timer fired");
            let _ = mailbox
                .send(ControllerCommand::Timeout { height, round })
                .await;
        });

        self.timers.insert(height, handle);
        debug!(height, round, ?timeout, "round timer armed");
    }

    /// Cancel the timer for `height`. No-op if none is armed.
    pub fn stop(&mut self, height: Height) {
        if let Some(handle) = self.timers.remove(&height) {
            handle.abort();
            trace!(height, "round timer stopped");
        }
    }

    /// Cancel all timers. Called during shutdown.
    pub fn stop_all(&mut self) {
        for (height, handle) in self.timers.drain() {
            handle.abort();
            trace!(height, "round timer stopped (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for RoundTimers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_schedule() {
        assert_eq!(round_timeout(1), QUICK_TIMEOUT);
        assert_eq!(round_timeout(8), QUICK_TIMEOUT);
        assert_eq!(round_timeout(9), SLOW_TIMEOUT);
        assert_eq!(round_timeout(100), SLOW_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_into_mailbox() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = RoundTimers::new(tx);
        timers.start(10, 1);

        tokio::time::advance(QUICK_TIMEOUT + Duration::from_millis(1)).await;
        match rx.recv().await {
            Some(ControllerCommand::Timeout { height, round }) => {
                assert_eq!((height, round), (10, 1));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_fire_and_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = RoundTimers::new(tx);
        timers.start(10, 1);
        timers.stop(10);
        timers.stop(10);

        tokio::time::advance(SLOW_TIMEOUT).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_round() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = RoundTimers::new(tx);
        timers.start(10, 1);
        timers.start(10, 2);
        assert_eq!(timers.active_count(), 1);

        tokio::time::advance(QUICK_TIMEOUT + Duration::from_millis(1)).await;
        match rx.recv().await {
            Some(ControllerCommand::Timeout { round, .. }) => assert_eq!(round, 2),
            other => panic!("unexpected command: {other:?}"),
        }
        // Only the replacement fired.
        assert!(rx.try_recv().is_err());
    }
}
