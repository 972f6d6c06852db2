//! Update-Rate Backoff
//!
//! Counts external writes per static name in fixed windows. Once a name
//! exceeds `max_updates` in a window, its raw value keeps updating on every
//! write but its transitive dependents are frozen at their last values for
//! the backoff duration. When the backoff timer fires, the dependents are
//! unfrozen and, if the name was written meanwhile, invalidated.
//!
//! Backoff is load shedding, not an error.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::graph::NodeId;

/// Per-name write counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: Duration,
    pub backoff_until: Option<Duration>,
}

impl RateWindow {
    fn fresh(now: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            backoff_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateDecision {
    Normal,
    /// This write crossed the threshold.
    EnterBackoff { until: Duration },
    InBackoff,
}

#[derive(Debug, Default)]
pub(crate) struct RateLimiter {
    config: Option<RateLimitConfig>,
    windows: HashMap<NodeId, RateWindow>,
    /// Frozen node -> number of backoffs freezing it.
    frozen: HashMap<NodeId, u32>,
    frozen_by: HashMap<NodeId, Vec<NodeId>>,
    /// Sources written with a changed value during backoff.
    deferred: HashSet<NodeId>,
}

impl RateLimiter {
    pub fn new(config: Option<RateLimitConfig>) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Count a write to `source` at `now`.
    pub fn record(&mut self, source: NodeId, now: Duration) -> RateDecision {
        let Some(config) = &self.config else {
            return RateDecision::Normal;
        };

        let window = self
            .windows
            .entry(source)
            .or_insert_with(|| RateWindow::fresh(now));

        // The expiry timer ends backoff, not the clock.
        if window.backoff_until.is_some() {
            return RateDecision::InBackoff;
        }

        if now.saturating_sub(window.window_start) >= config.window() {
            *window = RateWindow::fresh(now);
        }
        window.count += 1;

        if window.count > config.max_updates {
            let until = now + config.backoff();
            window.backoff_until = Some(until);
            RateDecision::EnterBackoff { until }
        } else {
            RateDecision::Normal
        }
    }

    pub fn freeze(&mut self, source: NodeId, dependents: Vec<NodeId>) {
        for node in &dependents {
            *self.frozen.entry(*node).or_default() += 1;
        }
        self.frozen_by.insert(source, dependents);
    }

    pub fn defer(&mut self, source: NodeId) {
        self.deferred.insert(source);
    }

    /// End backoff on `source`. Returns whether it was written meanwhile.
    pub fn expire(&mut self, source: NodeId, now: Duration) -> bool {
        self.windows.insert(source, RateWindow::fresh(now));

        for node in self.frozen_by.remove(&source).unwrap_or_default() {
            if let Some(count) = self.frozen.get_mut(&node) {
                *count -= 1;
                if *count == 0 {
                    self.frozen.remove(&node);
                }
            }
        }

        self.deferred.remove(&source)
    }

    pub fn is_frozen(&self, node: NodeId) -> bool {
        self.frozen.contains_key(&node)
    }

    pub fn window(&self, source: NodeId) -> Option<RateWindow> {
        self.windows.get(&source).copied()
    }

    pub fn windows(&self) -> impl Iterator<Item = (NodeId, RateWindow)> + '_ {
        self.windows.iter().map(|(&id, &window)| (id, window))
    }

    pub fn frozen(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.frozen.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_updates: u32) -> RateLimiter {
        RateLimiter::new(Some(RateLimitConfig {
            max_updates,
            window_ms: 100,
            backoff_ms: 500,
        }))
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn unlimited_without_config() {
        let mut rate = RateLimiter::new(None);
        let source = NodeId::from_index(0);
        for i in 0..1000 {
            assert_eq!(rate.record(source, ms(i)), RateDecision::Normal);
        }
    }

    #[test]
    fn crossing_threshold_enters_backoff() {
        let mut rate = limiter(3);
        let source = NodeId::from_index(0);

        for _ in 0..3 {
            assert_eq!(rate.record(source, ms(1)), RateDecision::Normal);
        }
        assert_eq!(
            rate.record(source, ms(2)),
            RateDecision::EnterBackoff { until: ms(502) }
        );
        assert_eq!(rate.record(source, ms(3)), RateDecision::InBackoff);
        assert_eq!(rate.window(source).unwrap().backoff_until, Some(ms(502)));
    }

    #[test]
    fn window_resets_after_elapsing() {
        let mut rate = limiter(2);
        let source = NodeId::from_index(0);

        rate.record(source, ms(0));
        rate.record(source, ms(50));
        assert_eq!(rate.record(source, ms(120)), RateDecision::Normal);
        assert_eq!(rate.window(source).unwrap().count, 1);
    }

    #[test]
    fn expiry_unfreezes_and_reports_deferred_writes() {
        let mut rate = limiter(1);
        let a = NodeId::from_index(0);
        let b = NodeId::from_index(1);
        let shared = NodeId::from_index(2);

        rate.freeze(a, vec![shared]);
        rate.freeze(b, vec![shared]);
        rate.defer(a);

        assert!(rate.expire(a, ms(10)));
        // Still frozen by `b`.
        assert!(rate.is_frozen(shared));

        assert!(!rate.expire(b, ms(10)));
        assert!(!rate.is_frozen(shared));
        assert_eq!(rate.frozen().count(), 0);
    }
}
