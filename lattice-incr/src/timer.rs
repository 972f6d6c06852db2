//! Clocks and Timers
//!
//! The engine never sleeps on its own. Delayed work (auto-batch flushes,
//! backoff expiry) goes into a per-instance [`TimerQueue`] keyed by a
//! [`Clock`]. Due backoffs run at the start of every engine operation. The
//! auto-flush only runs on [`crate::Engine::run_due_timers`] or from
//! [`crate::Engine::drive`] under tokio, so writes made in the same turn
//! share one transaction even with a zero delay.
//!
//! Tests inject a [`ManualClock`] and advance it by hand.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::graph::NodeId;

/// Monotonic time source, measured from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall-clock time from `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Tokio time. Honours paused time in tokio tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Work the engine schedules for later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// Flush the implicit transaction opened at `epoch`.
    AutoFlush { epoch: u64 },
    /// Backoff on a static node has elapsed.
    BackoffExpired { node: NodeId },
}

/// Which timers an operation may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerScope {
    /// Backoff expiry only. Used before ordinary operations.
    Backoff,
    All,
}

/// Deadline-ordered backoff timers plus at most one auto-flush.
pub(crate) struct TimerQueue {
    clock: Rc<dyn Clock>,
    backoffs: BinaryHeap<Reverse<(Duration, u64, NodeId)>>,
    /// Deadline and epoch of the open auto-batch.
    auto_flush: Option<(Duration, u64)>,
    seq: u64,
    /// Set when something was scheduled since the last `take_scheduled`.
    scheduled: bool,
}

impl TimerQueue {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            backoffs: BinaryHeap::new(),
            auto_flush: None,
            seq: 0,
            scheduled: false,
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule backoff expiry for `node` after `delay`.
    pub fn schedule_backoff(&mut self, delay: Duration, node: NodeId) -> Duration {
        let deadline = self.now() + delay;
        self.seq += 1;
        self.backoffs.push(Reverse((deadline, self.seq, node)));
        self.scheduled = true;
        deadline
    }

    /// Schedule the auto-flush for `epoch`, replacing any earlier one.
    pub fn schedule_auto_flush(&mut self, delay: Duration, epoch: u64) -> Duration {
        let deadline = self.now() + delay;
        self.auto_flush = Some((deadline, epoch));
        self.scheduled = true;
        deadline
    }

    /// Drop the auto-flush once its transaction has committed.
    pub fn cancel_auto_flush(&mut self) {
        self.auto_flush = None;
    }

    /// Pop the earliest due event within `scope`.
    pub fn pop_due(&mut self, scope: TimerScope) -> Option<TimerEvent> {
        let now = self.now();
        let backoff = self
            .backoffs
            .peek()
            .map(|Reverse((deadline, _, _))| *deadline)
            .filter(|deadline| *deadline <= now);
        let auto = self
            .auto_flush
            .filter(|(deadline, _)| scope == TimerScope::All && *deadline <= now);

        match (backoff, auto) {
            (Some(b), Some((a, epoch))) if a < b => {
                self.auto_flush = None;
                Some(TimerEvent::AutoFlush { epoch })
            }
            (Some(_), _) => self
                .backoffs
                .pop()
                .map(|Reverse((_, _, node))| TimerEvent::BackoffExpired { node }),
            (None, Some((_, epoch))) => {
                self.auto_flush = None;
                Some(TimerEvent::AutoFlush { epoch })
            }
            (None, None) => None,
        }
    }

    /// Time until the earliest deadline, zero if already due.
    pub fn next_delay(&self) -> Option<Duration> {
        let backoff = self.backoffs.peek().map(|Reverse((deadline, _, _))| *deadline);
        let auto = self.auto_flush.map(|(deadline, _)| deadline);
        let earliest = match (backoff, auto) {
            (Some(b), Some(a)) => Some(b.min(a)),
            (b, a) => b.or(a),
        };
        earliest.map(|deadline| deadline.saturating_sub(self.now()))
    }

    pub fn take_scheduled(&mut self) -> bool {
        std::mem::take(&mut self.scheduled)
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("now", &self.now())
            .field("backoffs", &self.backoffs.len())
            .field("auto_flush", &self.auto_flush)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: usize) -> NodeId {
        NodeId::from_index(index)
    }

    #[test]
    fn events_come_due_in_deadline_order() {
        let clock = ManualClock::new();
        let mut timers = TimerQueue::new(Rc::new(clock.clone()));

        timers.schedule_backoff(Duration::from_millis(20), node(2));
        timers.schedule_auto_flush(Duration::from_millis(15), 1);
        timers.schedule_backoff(Duration::from_millis(10), node(1));

        assert_eq!(timers.pop_due(TimerScope::All), None);
        assert_eq!(timers.next_delay(), Some(Duration::from_millis(10)));

        clock.advance_ms(25);
        assert_eq!(
            timers.pop_due(TimerScope::All),
            Some(TimerEvent::BackoffExpired { node: node(1) })
        );
        assert_eq!(
            timers.pop_due(TimerScope::All),
            Some(TimerEvent::AutoFlush { epoch: 1 })
        );
        assert_eq!(
            timers.pop_due(TimerScope::All),
            Some(TimerEvent::BackoffExpired { node: node(2) })
        );
        assert_eq!(timers.pop_due(TimerScope::All), None);
    }

    #[test]
    fn zero_delay_auto_flush_waits_for_a_full_run() {
        let mut timers = TimerQueue::new(Rc::new(ManualClock::new()));
        timers.schedule_auto_flush(Duration::ZERO, 7);

        assert!(timers.take_scheduled());
        assert!(!timers.take_scheduled());
        assert_eq!(timers.pop_due(TimerScope::Backoff), None);
        assert_eq!(timers.next_delay(), Some(Duration::ZERO));
        assert_eq!(
            timers.pop_due(TimerScope::All),
            Some(TimerEvent::AutoFlush { epoch: 7 })
        );
    }

    #[test]
    fn auto_flush_is_replaced_and_cancelled() {
        let clock = ManualClock::new();
        let mut timers = TimerQueue::new(Rc::new(clock.clone()));

        timers.schedule_auto_flush(Duration::from_millis(5), 1);
        timers.cancel_auto_flush();
        assert_eq!(timers.next_delay(), None);

        timers.schedule_auto_flush(Duration::from_millis(5), 2);
        timers.schedule_auto_flush(Duration::from_millis(5), 3);
        clock.advance_ms(5);
        assert_eq!(
            timers.pop_due(TimerScope::All),
            Some(TimerEvent::AutoFlush { epoch: 3 })
        );
        assert_eq!(timers.pop_due(TimerScope::All), None);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance_ms(5);
        assert_eq!(other.now(), Duration::from_millis(5));
    }
}
