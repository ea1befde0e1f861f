//! Timer bookkeeping for per-message timeouts and the channel-wide
//! activity watchdog (spec.md §4.5.3): "Per-message timeout is armed
//! on enqueue; firing removes the message from either queue or table
//! and invokes continuation with `TimedOut`. A channel-wide activity
//! watchdog emits `NoActivity` after `soft`ms and closes after
//! `hard`ms; it synthesizes outbound no-op traffic at
//! `min(soft,hard)/3` to keep the counterpart informed."
//!
//! This is deliberately plain scheduling data, not an I/O-driving
//! timer wheel: the owning channel's event loop (spec.md §5,
//! "single-threaded cooperative per channel") holds one of these, asks
//! it for the next deadline, sleeps until then with
//! `tokio::time::sleep_until`, and calls [`TimerSet::pop_due`] when it
//! wakes — the same shape as the send queue and pending table, which
//! are also passive state the loop drives rather than active tasks of
//! their own.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A single query's per-message timeout; carries its slot.
    MessageTimeout(u32),
    /// `soft`ms of silence: emit `NoActivity` but stay open.
    WatchdogSoft,
    /// `hard`ms of silence: close the channel.
    WatchdogHard,
    /// `min(soft, hard)/3`: send a synthetic NOP to keep the peer
    /// informed the channel is alive.
    WatchdogKeepalive,
    /// `retry_delay` after a closed, auto-reconnecting channel schedules
    /// its next connect attempt (spec.md §4.5.4).
    Reconnect,
}

struct Entry {
    deadline: Instant,
    kind: TimerKind,
}

/// A set of outstanding timers, ordered by deadline. Cancellation is
/// lazy: a canceled handle's entry is simply absent from `entries`
/// when its heap slot is eventually popped.
#[derive(Default)]
pub struct TimerSet {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
    next_handle: u64,
}

/// Opaque handle to a scheduled timer, returned by [`TimerSet::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, kind: TimerKind) -> TimerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(handle, Entry { deadline, kind });
        self.heap.push(Reverse((deadline, handle)));
        TimerHandle(handle)
    }

    pub fn schedule_after(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle {
        self.schedule(Instant::now() + delay, kind)
    }

    /// Cancels a timer; a no-op if it already fired or was already
    /// canceled (spec.md §4.5.5 "Double-cancel is a no-op").
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.remove(&handle.0);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pops and returns every timer whose deadline is at or before
    /// `now`, in deadline order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        while let Some(&Reverse((deadline, handle))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&handle) {
                fired.push(entry.kind);
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes the watchdog's three deadlines given `soft`/`hard`
/// timeouts, relative to `now` (spec.md §4.5.3).
pub fn watchdog_deadlines(now: Instant, soft: Duration, hard: Duration) -> [(Instant, TimerKind); 3] {
    let keepalive = soft.min(hard) / 3;
    [
        (now + soft, TimerKind::WatchdogSoft),
        (now + hard, TimerKind::WatchdogHard),
        (now + keepalive, TimerKind::WatchdogKeepalive),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_pop_in_deadline_order() {
        let mut set = TimerSet::new();
        let base = Instant::now();
        set.schedule(base + Duration::from_millis(30), TimerKind::WatchdogHard);
        set.schedule(base + Duration::from_millis(10), TimerKind::MessageTimeout(1));
        set.schedule(base + Duration::from_millis(20), TimerKind::WatchdogSoft);
        let fired = set.pop_due(base + Duration::from_millis(25));
        assert_eq!(fired, vec![TimerKind::MessageTimeout(1), TimerKind::WatchdogSoft]);
        assert_eq!(set.next_deadline(), Some(base + Duration::from_millis(30)));
    }

    #[test]
    fn canceled_timer_never_fires() {
        let mut set = TimerSet::new();
        let base = Instant::now();
        let handle = set.schedule(base + Duration::from_millis(10), TimerKind::MessageTimeout(1));
        set.cancel(handle);
        let fired = set.pop_due(base + Duration::from_secs(1));
        assert!(fired.is_empty());
    }

    #[test]
    fn watchdog_keepalive_is_a_third_of_the_shorter_timeout() {
        let now = Instant::now();
        let deadlines = watchdog_deadlines(now, Duration::from_millis(300), Duration::from_millis(900));
        assert_eq!(deadlines[2].0, now + Duration::from_millis(100));
    }
}
