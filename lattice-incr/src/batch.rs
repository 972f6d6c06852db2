//! Transactions and Batching
//!
//! Every write, settlement and lazy recomputation is recorded into the open
//! [`Transaction`]. When the transaction is committed, stale nodes are
//! recomputed, and each name whose value actually changed is reported once.
//!
//! A transaction commits at the end of each engine operation unless a batch
//! holds it open:
//!
//! - An explicit batch (`Engine::batch`) commits synchronously when the
//!   outermost batch closes.
//! - Auto-batching keeps an implicit transaction open after a write and
//!   commits it when the auto-flush timer fires or when a read arrives,
//!   whichever comes first.

use std::time::Duration;

use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};

use crate::graph::NodeId;
use crate::value::Value;

/// First and latest value of a node within one transaction.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    pub before: Option<Value>,
    pub after: Value,
}

/// Writes and value changes accumulated since the last commit.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    /// Names written or settled from outside the evaluator.
    pub triggers: IndexSet<NodeId>,
    pub changes: IndexMap<NodeId, Change>,
    /// Recompute stale nodes at commit even without a trigger.
    pub flush_requested: bool,
}

impl Transaction {
    pub fn record_trigger(&mut self, node: NodeId) {
        self.triggers.insert(node);
    }

    /// Keep the value from before the transaction, replace the latest.
    pub fn record_change(&mut self, node: NodeId, before: Option<Value>, after: Value) {
        match self.changes.entry(node) {
            Entry::Occupied(mut entry) => entry.get_mut().after = after,
            Entry::Vacant(entry) => {
                entry.insert(Change { before, after });
            }
        }
    }

    pub fn needs_flush(&self) -> bool {
        self.flush_requested || !self.triggers.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty() && self.changes.is_empty()
    }
}

/// Tracks open batches and the pending auto-flush.
#[derive(Debug, Default)]
pub(crate) struct BatchManager {
    depth: u32,
    auto_delay: Option<Duration>,
    auto_pending: bool,
    epoch: u64,
    txn: Transaction,
}

impl BatchManager {
    pub fn new(auto_delay: Option<Duration>) -> Self {
        Self {
            auto_delay,
            ..Self::default()
        }
    }

    pub fn txn(&mut self) -> &mut Transaction {
        &mut self.txn
    }

    pub fn take(&mut self) -> Transaction {
        self.auto_pending = false;
        std::mem::take(&mut self.txn)
    }

    pub fn open(&mut self) {
        self.depth += 1;
    }

    /// Returns `true` when the outermost batch closed.
    pub fn close(&mut self) -> bool {
        self.depth = self.depth.saturating_sub(1);
        self.depth == 0
    }

    pub fn in_batch(&self) -> bool {
        self.depth > 0
    }

    pub fn auto_pending(&self) -> bool {
        self.auto_pending
    }

    /// Hold the transaction open for auto-flush.
    ///
    /// Returns the delay and epoch to schedule if no auto-flush was pending.
    /// Explicit batches take priority, so this is a no-op inside one.
    pub fn defer_auto(&mut self) -> Option<(Duration, u64)> {
        let delay = self.auto_delay?;
        if self.in_batch() || self.auto_pending {
            return None;
        }
        self.auto_pending = true;
        self.epoch += 1;
        Some((delay, self.epoch))
    }

    /// Whether an auto-flush timer for `epoch` is still current.
    pub fn is_current_auto(&self, epoch: u64) -> bool {
        self.auto_pending && self.epoch == epoch
    }

    /// The transaction commits at the end of the current operation.
    pub fn commits_now(&self) -> bool {
        !self.in_batch() && !self.auto_pending
    }
}
