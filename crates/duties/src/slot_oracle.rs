//! Beacon-slot boundary ticks anchored at genesis time.

use dv_types::{NetworkConfig, Slot};
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::debug;

/// Keeps track of Ethereum slots as they change over time.
///
/// `next` re-arms an internal timer at every call, so a double call without
/// awaiting never double-arms — the pending deadline is simply replaced. The
/// caller is responsible for calling `next` repeatedly to keep the oracle
/// advancing; if the caller falls behind, the oracle jumps to the freshest
/// upcoming slot with no missed-slot replay.
///
/// Genesis is held as a signed offset from a monotonic anchor taken at
/// construction, since genesis itself usually predates what the monotonic
/// clock can represent.
///
/// Not thread-safe by design; the owning handler task is the only caller.
pub struct SlotOracle {
    anchor: Instant,
    /// Nanoseconds from genesis to the anchor; negative when genesis is in
    /// the future.
    since_genesis_at_anchor: i128,
    slot_duration: Duration,
    /// The slot the pending (or most recent) tick corresponds to.
    slot: Slot,
    sleep: Pin<Box<Sleep>>,
}

impl SlotOracle {
    /// Build from network configuration, anchoring the unix genesis time
    /// against the wall clock once.
    pub fn new(config: &NetworkConfig) -> Self {
        let genesis = UNIX_EPOCH + Duration::from_secs(config.genesis_time);
        let since_genesis = match SystemTime::now().duration_since(genesis) {
            Ok(elapsed) => elapsed.as_nanos() as i128,
            Err(err) => -(err.duration().as_nanos() as i128),
        };
        Self::from_offset(since_genesis, config.slot_duration)
    }

    /// Build from a genesis pinned on the monotonic clock (tests pin this to
    /// the paused clock).
    pub fn with_genesis(genesis: Instant, slot_duration: Duration) -> Self {
        let now = Instant::now();
        let since_genesis = match now.checked_duration_since(genesis) {
            Some(elapsed) => elapsed.as_nanos() as i128,
            None => -((genesis - now).as_nanos() as i128),
        };
        Self::from_offset(since_genesis, slot_duration)
    }

    fn from_offset(since_genesis_at_anchor: i128, slot_duration: Duration) -> Self {
        let anchor = Instant::now();
        let slot_nanos = slot_duration.as_nanos() as i128;
        let (first_deadline_offset, slot) = if since_genesis_at_anchor < 0 {
            // Genesis in the future: first tick signals slot 0 at genesis.
            (0, 0)
        } else {
            let slots_since = (since_genesis_at_anchor / slot_nanos) as u64;
            ((slots_since as i128 + 1) * slot_nanos, slots_since)
        };
        let mut oracle = SlotOracle {
            anchor,
            since_genesis_at_anchor,
            slot_duration,
            slot,
            sleep: Box::pin(sleep_until(anchor)),
        };
        let deadline = oracle.instant_at(first_deadline_offset);
        oracle.sleep.as_mut().reset(deadline);
        oracle
    }

    /// The slot the next tick will signal.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Wait for the next slot boundary and return the slot that just
    /// started.
    pub async fn next(&mut self) -> Slot {
        let elapsed = self.elapsed_since_genesis();
        if elapsed < 0 {
            // Waiting for the tick at genesis, signalling slot 0.
            let genesis = self.instant_at(0);
            self.sleep.as_mut().reset(genesis);
            self.sleep.as_mut().await;
            return self.slot;
        }

        let slot_nanos = self.slot_duration.as_nanos() as i128;
        let mut next_slot = (elapsed / slot_nanos) as u64 + 1;
        if next_slot <= self.slot {
            // Already ticked for this slot; wait for the one after.
            next_slot = self.slot + 1;
            debug!(slot = self.slot, "slot oracle: double tick");
        }
        let deadline = self.instant_at(next_slot as i128 * slot_nanos);
        self.sleep.as_mut().reset(deadline);
        self.slot = next_slot;
        self.sleep.as_mut().await;
        next_slot
    }

    /// Nanoseconds elapsed since genesis; negative before genesis.
    fn elapsed_since_genesis(&self) -> i128 {
        self.since_genesis_at_anchor + (Instant::now() - self.anchor).as_nanos() as i128
    }

    /// Monotonic instant of a nanosecond offset from genesis. Only called
    /// for offsets at or after the anchor (upcoming slot boundaries), which
    /// the monotonic clock can always represent.
    fn instant_at(&self, nanos_from_genesis: i128) -> Instant {
        let from_anchor = nanos_from_genesis - self.since_genesis_at_anchor;
        self.anchor + Duration::from_nanos(from_anchor.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOT: Duration = Duration::from_secs(12);

    #[tokio::test(start_paused = true)]
    async fn ticks_consecutive_slots() {
        let genesis = Instant::now();
        let mut oracle = SlotOracle::with_genesis(genesis, SLOT);
        assert_eq!(oracle.next().await, 1);
        assert_eq!(oracle.slot(), 1);
        assert_eq!(oracle.next().await, 2);
        assert_eq!(oracle.next().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn genesis_in_future_ticks_slot_zero_at_genesis() {
        let genesis = Instant::now() + Duration::from_secs(60);
        let mut oracle = SlotOracle::with_genesis(genesis, SLOT);
        assert_eq!(oracle.slot(), 0);

        let started = Instant::now();
        assert_eq!(oracle.next().await, 0);
        assert_eq!(Instant::now() - started, Duration::from_secs(60));
        // After genesis the oracle proceeds to slot 1.
        assert_eq!(oracle.next().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_caller_jumps_to_fresh_slot() {
        let genesis = Instant::now();
        let mut oracle = SlotOracle::with_genesis(genesis, SLOT);
        assert_eq!(oracle.next().await, 1);

        // The caller stalls for five slots.
        tokio::time::sleep(SLOT * 5).await;
        let slot = oracle.next().await;
        assert_eq!(slot, 7, "no replay of missed slots");
    }

    #[tokio::test(start_paused = true)]
    async fn exact_boundary_ticks_next_slot() {
        let genesis = Instant::now();
        // Land exactly on the start of slot 3.
        tokio::time::sleep(SLOT * 3).await;
        let mut oracle = SlotOracle::with_genesis(genesis, SLOT);
        assert_eq!(oracle.next().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn double_call_does_not_double_arm() {
        let genesis = Instant::now();
        let mut oracle = SlotOracle::with_genesis(genesis, SLOT);

        // Abandon a half-finished wait, then call again. The abandoned slot
        // is forfeited and the timer is re-armed once, for the slot after.
        {
            let pending = oracle.next();
            tokio::pin!(pending);
            let raced = tokio::time::timeout(Duration::from_secs(1), &mut pending).await;
            assert!(raced.is_err(), "slot boundary not reached yet");
        }
        assert_eq!(oracle.next().await, 2);
        assert_eq!(oracle.next().await, 3);
    }
}
