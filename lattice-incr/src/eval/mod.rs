//! Evaluator
//!
//! The evaluator exclusively owns one instance's graph, staleness set,
//! pending table, open transaction and timers. Everything the public
//! [`crate::Engine`] does funnels through a `&mut Evaluator`.
//!
//! # Staleness
//!
//! A write marks the direct dependents of the written name `Dirty` and every
//! further transitive dependent `MaybeDirty`, all before anything runs. A
//! node is brought up to date by [`Evaluator::resolve`]:
//!
//! 1. `Dirty` or never computed: run the producer.
//! 2. `MaybeDirty`: resolve each dependency first. If none of them changed
//!    since this node was last verified, mark it clean without running.
//!
//! Unchanged values therefore stop propagation even though marking is
//! eager and transitive.
//!
//! # Cycles
//!
//! Nodes being resolved sit on an explicit stack. Reaching a node that is
//! already on the stack halts the instance with the stack from the first
//! occurrence, e.g. `[tick, tock, tick]`.

mod gate;

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use indexmap::IndexSet;
use tracing::{debug, error, trace, warn};

use crate::batch::BatchManager;
use crate::change::ChangeDetector;
use crate::config::EngineConfig;
use crate::error::{ComputeError, EngineError, FatalError, FatalRecord, EXTERNAL_WRITER};
use crate::graph::{
    extract, Declaration, Declarations, Dependencies, DirtyState, Graph, Interrupt, NodeId,
    Output, Settled, Settlement, SettlementSink,
};
use crate::inspect::{NodeChange, NodeState, Snapshot, TraceEvent};
use crate::rate::{RateDecision, RateLimiter, RateWindow};
use crate::timer::{Clock, TimerEvent, TimerQueue, TimerScope};
use crate::value::Value;

use gate::AsyncGate;

/// Stack left before `resolve` switches to a fresh segment.
const RED_ZONE: usize = 100 * 1024;
const STACK_SEGMENT: usize = 1024 * 1024;

/// Outcome of bringing one node up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The node holds a usable value.
    Ready,
    /// The node waits on this pending root.
    Blocked(NodeId),
    /// Fatal State.
    Halted,
}

/// Work for the engine to deliver once the evaluator is released.
pub(crate) enum Outgoing {
    Notify { name: Rc<str>, value: Value },
    Trace(TraceEvent),
    Fatal(Snapshot),
}

/// Name of the node whose producer was running when `Engine::set` was
/// called from inside it.
pub(crate) type ReentrySlot = Rc<RefCell<Option<String>>>;

pub(crate) struct Evaluator {
    graph: Graph,
    /// Derived nodes that are not clean.
    stale: IndexSet<NodeId>,
    /// Active evaluation stack.
    stack: Vec<NodeId>,
    gate: AsyncGate,
    change: ChangeDetector,
    rate: RateLimiter,
    batch: BatchManager,
    timers: TimerQueue,
    revision: u64,
    fatal: Option<FatalRecord>,
    fatal_reported: bool,
    trace_enabled: bool,
    outbox: Vec<Outgoing>,
    sink: Weak<dyn SettlementSink>,
    reentry: ReentrySlot,
}

impl Evaluator {
    pub fn new(
        config: &EngineConfig,
        clock: Rc<dyn Clock>,
        sink: Weak<dyn SettlementSink>,
        reentry: ReentrySlot,
        trace_enabled: bool,
    ) -> Self {
        Self {
            graph: Graph::new(),
            stale: IndexSet::new(),
            stack: Vec::new(),
            gate: AsyncGate::default(),
            change: ChangeDetector::new(config.equality()),
            rate: RateLimiter::new(config.rate_limit.clone()),
            batch: BatchManager::new(config.auto_batch_delay()),
            timers: TimerQueue::new(clock),
            revision: 0,
            fatal: None,
            fatal_reported: false,
            trace_enabled,
            outbox: Vec::new(),
            sink,
            reentry,
        }
    }

    /// Add nodes. Either every name is added or none is.
    pub fn extend(&mut self, declarations: Declarations) -> Result<(), EngineError> {
        if let Some(name) = declarations
            .names()
            .find(|name| self.graph.lookup(name).is_some())
        {
            return Err(EngineError::DuplicateName(name.to_string()));
        }

        for (name, declaration) in declarations {
            match declaration {
                Declaration::Static(value) => {
                    self.graph.add_static(&name, value)?;
                }
                Declaration::Derived(producer) => {
                    let id = self.graph.add_derived(&name, producer)?;
                    self.stale.insert(id);
                }
            }
        }
        debug!(nodes = self.graph.len(), "graph extended");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Current value of `name`, bringing it up to date first.
    ///
    /// `None` while the node is pending or has never produced a value.
    pub fn get(&mut self, name: &str) -> Result<Option<Value>, EngineError> {
        let id = self.lookup(name)?;

        if self.fatal.is_none() {
            if self.batch.auto_pending() && !self.batch.in_batch() {
                debug!(node = name, "read forces pending auto-flush");
                self.flush();
            }
            if self.fatal.is_none() {
                self.resolve(id);
            }
        }

        if self.gate.is_pending(id) {
            return Ok(None);
        }
        Ok(self.graph[id].value.clone())
    }

    /// Write a static node.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        if self.fatal.is_some() {
            return Err(EngineError::Halted);
        }
        let id = self.lookup(name)?;

        if self.graph[id].is_derived() {
            let err = FatalError::IllegalWrite {
                writer: EXTERNAL_WRITER.to_string(),
                target: name.to_string(),
            };
            self.raise(err.clone());
            return Err(err.into());
        }

        let decision = self.rate.record(id, self.timers.now());
        let previous = self.graph[id].value.clone();
        let changed = self.change.changed(previous.as_ref(), &value);

        self.batch.txn().record_trigger(id);
        if changed {
            self.revision += 1;
            self.graph[id].changed_at = self.revision;
            self.batch.txn().record_change(id, previous, value.clone());
        }
        self.graph[id].value = Some(value);

        match decision {
            RateDecision::Normal => {
                if changed {
                    self.invalidate(id);
                }
            }
            RateDecision::EnterBackoff { until } => {
                let frozen = self.graph.transitive_dependents(id);
                warn!(
                    node = name,
                    dependents = frozen.len(),
                    "update rate exceeded, freezing dependents"
                );
                self.rate.freeze(id, frozen);
                let delay = until.saturating_sub(self.timers.now());
                self.timers.schedule_backoff(delay, id);
                if changed {
                    self.rate.defer(id);
                }
            }
            RateDecision::InBackoff => {
                if changed {
                    self.rate.defer(id);
                }
            }
        }

        if let Some((delay, epoch)) = self.batch.defer_auto() {
            self.timers.schedule_auto_flush(delay, epoch);
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<NodeId, EngineError> {
        self.graph
            .lookup(name)
            .ok_or_else(|| EngineError::UnknownName(name.to_string()))
    }

    /// Mark everything downstream of `source` for verification.
    fn invalidate(&mut self, source: NodeId) {
        let direct: Vec<NodeId> = self.graph[source].dependents().iter().copied().collect();
        for id in direct {
            self.graph[id].mark_dirty();
            self.stale.insert(id);
        }
        for id in self.graph.transitive_dependents(source) {
            self.graph[id].mark_maybe_dirty();
            self.stale.insert(id);
        }
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Bring `id` up to date.
    pub fn resolve(&mut self, id: NodeId) -> Resolution {
        if self.fatal.is_some() {
            return Resolution::Halted;
        }
        if let Some(pos) = self.stack.iter().position(|&on| on == id) {
            let mut cycle: Vec<String> = self.stack[pos..]
                .iter()
                .map(|&n| self.graph.name(n).to_string())
                .collect();
            cycle.push(self.graph.name(id).to_string());
            self.raise(FatalError::CircularDependency { stack: cycle });
            return Resolution::Halted;
        }

        if !self.graph[id].is_derived() {
            return Resolution::Ready;
        }
        if self.gate.is_pending(id) {
            return Resolution::Blocked(id);
        }
        if !self.stale.contains(&id) || self.rate.is_frozen(id) {
            return Resolution::Ready;
        }
        if let Some(root) = self.gate.blocker(id) {
            return Resolution::Blocked(root);
        }

        self.stack.push(id);
        // Producers read through `resolve`, so a first read of a long chain
        // recurses once per link.
        let resolution = stacker::maybe_grow(RED_ZONE, STACK_SEGMENT, || self.refresh(id));
        self.stack.pop();
        resolution
    }

    fn refresh(&mut self, id: NodeId) -> Resolution {
        let node = &self.graph[id];
        if node.value.is_none() || node.dirty_state() == DirtyState::Dirty {
            return self.run(id);
        }

        let verified_at = node.verified_at;
        let deps: Dependencies = node.dependencies().iter().copied().collect();
        let mut changed = false;
        for dep in deps {
            match self.resolve(dep) {
                Resolution::Ready => {}
                Resolution::Blocked(root) => {
                    self.gate.block(id, root);
                    return Resolution::Blocked(root);
                }
                Resolution::Halted => return Resolution::Halted,
            }
            if self.graph[dep].changed_at > verified_at {
                changed = true;
                break;
            }
        }

        if changed {
            return self.run(id);
        }
        trace!(node = self.graph.name(id), "verified without running");
        self.mark_verified(id);
        Resolution::Ready
    }

    fn run(&mut self, id: NodeId) -> Resolution {
        let Some(producer) = self.graph[id].producer.clone() else {
            return Resolution::Ready;
        };
        self.graph[id].generation += 1;
        trace!(
            node = self.graph.name(id),
            generation = self.graph[id].generation,
            "running producer"
        );

        let extraction = extract(self, id, &producer);

        let reentered = self.reentry.borrow_mut().take();
        if let Some(target) = reentered {
            let writer = self.graph.name(id).to_string();
            self.raise(FatalError::IllegalWrite { writer, target });
        }
        if self.fatal.is_some() {
            return Resolution::Halted;
        }

        match extraction.interrupt {
            Some(Interrupt::Halted) => return Resolution::Halted,
            Some(Interrupt::Blocked(root)) => {
                // Keep the old edges too so a later write still reaches
                // this node while it waits.
                let mut deps: Dependencies =
                    self.graph[id].dependencies().iter().copied().collect();
                for read in extraction.reads {
                    if !deps.contains(&read) {
                        deps.push(read);
                    }
                }
                self.graph.set_dependencies(id, deps);
                self.stale.insert(id);
                self.gate.block(id, root);
                trace!(
                    node = self.graph.name(id),
                    root = self.graph.name(root),
                    "blocked on pending value"
                );
                return Resolution::Blocked(root);
            }
            None => {}
        }

        self.graph.set_dependencies(id, extraction.reads.clone());
        self.graph[id].verified_at = self.revision;

        match extraction.output {
            Ok(Output::Ready(value)) => {
                self.commit(id, value);
                self.mark_verified(id);
                Resolution::Ready
            }
            Ok(Output::Pending) if extraction.deferred => {
                let generation = self.graph[id].generation;
                self.gate.start(id, generation);
                self.graph[id].mark_clean();
                self.stale.swap_remove(&id);
                trace!(node = self.graph.name(id), generation, "pending");
                Resolution::Blocked(id)
            }
            Ok(Output::Pending) => match extraction.staged {
                Some(value) => {
                    self.commit(id, value);
                    self.mark_verified(id);
                    Resolution::Ready
                }
                None => {
                    self.compute_exception(
                        id,
                        "returned pending without a settler or staged value".to_string(),
                    );
                    Resolution::Halted
                }
            },
            Err(ComputeError::Failed(message)) => {
                self.compute_exception(id, message);
                Resolution::Halted
            }
            // Interrupted without an interrupt: the producer made it up.
            Err(err) => {
                self.compute_exception(id, err.to_string());
                Resolution::Halted
            }
        }
    }

    fn mark_verified(&mut self, id: NodeId) {
        let node = &mut self.graph[id];
        node.mark_clean();
        node.verified_at = self.revision;
        self.stale.swap_remove(&id);
    }

    /// Store a computed value. Returns whether it counts as a change.
    fn commit(&mut self, id: NodeId, value: Value) -> bool {
        let previous = self.graph[id].value.take();
        let changed = self.change.changed(previous.as_ref(), &value);
        if changed {
            self.revision += 1;
            self.graph[id].changed_at = self.revision;
            self.batch
                .txn()
                .record_change(id, previous, value.clone());
        }
        self.graph[id].value = Some(value);
        changed
    }

    fn compute_exception(&mut self, id: NodeId, message: String) {
        let inputs = self.graph[id]
            .dependencies()
            .iter()
            .map(|&dep| {
                let value = self.graph[dep]
                    .value
                    .as_ref()
                    .map_or(serde_json::Value::Null, Value::to_json);
                (self.graph.name(dep).to_string(), value)
            })
            .collect();
        self.raise(FatalError::ComputeException {
            node: self.graph.name(id).to_string(),
            message,
            inputs,
        });
    }

    /// Enter Fatal State. Only the first fault is kept.
    pub fn raise(&mut self, err: FatalError) {
        if self.fatal.is_some() {
            return;
        }
        let stack = self
            .stack
            .iter()
            .map(|&id| self.graph.name(id).to_string())
            .collect();
        let record = FatalRecord::new(err, stack);
        error!(error = %record.message, stack = ?record.stack, "engine halted");
        self.fatal = Some(record);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn open_batch(&mut self) {
        self.batch.open();
    }

    pub fn close_batch(&mut self) {
        if self.batch.close() {
            self.flush();
        }
    }

    /// Recompute stale nodes and commit the open transaction.
    ///
    /// A no-op inside an explicit batch.
    pub fn flush(&mut self) {
        if self.batch.in_batch() {
            return;
        }
        self.recompute();
        self.finish_transaction();
    }

    fn recompute(&mut self) {
        if self.fatal.is_some() {
            return;
        }
        // Never-computed nodes stay lazy until something reads them.
        let candidates: Vec<NodeId> = self
            .stale
            .iter()
            .copied()
            .filter(|&id| {
                self.graph[id].generation > 0
                    && !self.gate.is_pending(id)
                    && self.gate.blocker(id).is_none()
                    && !self.rate.is_frozen(id)
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        debug!(
            candidates = candidates.len(),
            blocked = self.gate.blocked_count(),
            "flushing stale nodes"
        );
        for id in self.graph.topological_order(&candidates) {
            if self.fatal.is_some() {
                break;
            }
            if self.stale.contains(&id) {
                self.resolve(id);
            }
        }
    }

    /// Close out the current operation.
    pub fn end_operation(&mut self) {
        if self.fatal.is_some() {
            self.report_fatal();
            return;
        }
        if !self.batch.commits_now() {
            return;
        }
        if self.batch.txn().needs_flush() {
            self.flush();
        } else {
            self.finish_transaction();
        }
    }

    fn finish_transaction(&mut self) {
        if self.fatal.is_some() {
            self.report_fatal();
            return;
        }
        let txn = self.batch.take();
        self.timers.cancel_auto_flush();
        if txn.is_empty() {
            return;
        }

        let mut changes = Vec::new();
        for (id, change) in txn.changes {
            if !self.change.changed(change.before.as_ref(), &change.after) {
                continue;
            }
            self.outbox.push(Outgoing::Notify {
                name: self.graph[id].shared_name(),
                value: change.after.clone(),
            });
            if self.trace_enabled {
                changes.push(NodeChange {
                    name: self.graph.name(id).to_string(),
                    before: change.before,
                    after: change.after,
                });
            }
        }
        debug!(
            triggers = txn.triggers.len(),
            revision = self.revision,
            "transaction committed"
        );

        if self.trace_enabled {
            let triggers = txn
                .triggers
                .iter()
                .map(|&id| self.graph.name(id).to_string())
                .collect();
            self.outbox
                .push(Outgoing::Trace(TraceEvent { triggers, changes }));
        }
    }

    fn report_fatal(&mut self) {
        let _discarded = self.batch.take();
        self.timers.cancel_auto_flush();
        if self.fatal_reported {
            return;
        }
        self.fatal_reported = true;
        let snapshot = Snapshot::capture(self);
        self.outbox.push(Outgoing::Fatal(snapshot));
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // Settlements and timers
    // ------------------------------------------------------------------

    pub fn apply_settlement(&mut self, settlement: Settlement) {
        let Settlement {
            node: id,
            generation,
            result,
        } = settlement;

        let Some(released) = self.gate.finish(id, generation) else {
            debug!(
                node = self.graph.name(id),
                generation, "ignoring settlement of a superseded run"
            );
            return;
        };
        if self.fatal.is_some() {
            return;
        }
        debug!(
            node = self.graph.name(id),
            generation,
            released = released.len(),
            "settled"
        );

        self.batch.txn().record_trigger(id);
        match result {
            Settled::Value(value) => {
                if self.commit(id, value) {
                    self.invalidate(id);
                }
            }
            Settled::Failed(message) => self.compute_exception(id, message),
            Settled::Abandoned => {
                warn!(
                    node = self.graph.name(id),
                    "settler dropped without a value, keeping previous value"
                );
            }
        }
        for waiter in released {
            self.stale.insert(waiter);
        }
    }

    /// Run every timer in `scope` whose deadline has passed.
    pub fn run_due_timers(&mut self, scope: TimerScope) {
        while let Some(event) = self.timers.pop_due(scope) {
            match event {
                TimerEvent::AutoFlush { epoch } => {
                    if self.batch.is_current_auto(epoch) && !self.batch.in_batch() {
                        debug!(epoch, "auto-flush");
                        self.flush();
                    }
                }
                TimerEvent::BackoffExpired { node } => {
                    let now = self.timers.now();
                    let written = self.rate.expire(node, now);
                    debug!(node = self.graph.name(node), written, "backoff expired");
                    if written && self.fatal.is_none() {
                        self.invalidate(node);
                    }
                    let txn = self.batch.txn();
                    txn.record_trigger(node);
                    txn.flush_requested = true;
                }
            }
        }
    }

    pub fn take_timers_scheduled(&mut self) -> bool {
        self.timers.take_scheduled()
    }

    pub fn next_timer_delay(&self) -> Option<Duration> {
        self.timers.next_delay()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn sink(&self) -> Weak<dyn SettlementSink> {
        Weak::clone(&self.sink)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn fatal(&self) -> Option<&FatalRecord> {
        self.fatal.as_ref()
    }

    pub fn is_stale(&self, id: NodeId) -> bool {
        self.stale.contains(&id)
    }

    pub fn is_pending(&self, id: NodeId) -> bool {
        self.gate.is_pending(id)
    }

    pub fn is_frozen(&self, id: NodeId) -> bool {
        self.rate.is_frozen(id)
    }

    pub fn stale_nodes(&self) -> Vec<NodeId> {
        self.stale.iter().copied().collect()
    }

    pub fn pending_nodes(&self) -> Vec<NodeId> {
        self.gate.pending().collect()
    }

    pub fn frozen_nodes(&self) -> Vec<NodeId> {
        let mut frozen: Vec<NodeId> = self.rate.frozen().collect();
        frozen.sort();
        frozen
    }

    pub fn rate_window(&self, name: &str) -> Option<RateWindow> {
        self.rate.window(self.graph.lookup(name)?)
    }

    /// Every write counter, in node order.
    pub fn rate_windows(&self) -> Vec<(NodeId, RateWindow)> {
        let mut windows: Vec<_> = self.rate.windows().collect();
        windows.sort_by_key(|(id, _)| *id);
        windows
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        let id = self.graph.lookup(name)?;
        Some(NodeState::capture(self, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    struct NullSink;

    impl SettlementSink for NullSink {
        fn deliver(&self, _settlement: Settlement) {}
    }

    fn evaluator(declarations: Declarations) -> Evaluator {
        let sink: Weak<dyn SettlementSink> = Weak::<NullSink>::new();
        let mut eval = Evaluator::new(
            &EngineConfig::default(),
            Rc::new(ManualClock::new()),
            sink,
            Rc::new(RefCell::new(None)),
            true,
        );
        eval.extend(declarations).unwrap();
        eval
    }

    fn int(eval: &mut Evaluator, name: &str) -> i64 {
        eval.get(name).unwrap().and_then(|v| v.as_i64()).unwrap()
    }

    #[test]
    fn derived_nodes_start_stale_and_compute_lazily() {
        let mut eval = evaluator(
            Declarations::new()
                .value("a", 2)
                .derived("double", |acc| Ok(Value::from(acc.get("a")?.as_i64().unwrap_or(0) * 2))),
        );
        let double = eval.graph().lookup("double").unwrap();

        assert!(eval.is_stale(double));
        assert_eq!(int(&mut eval, "double"), 4);
        assert!(!eval.is_stale(double));
    }

    #[test]
    fn write_marks_transitive_dependents_before_running() {
        let mut eval = evaluator(
            Declarations::new()
                .value("a", 1)
                .derived("b", |acc| acc.get("a"))
                .derived("c", |acc| acc.get("b")),
        );
        assert_eq!(int(&mut eval, "c"), 1);

        eval.set("a", Value::from(5)).unwrap();
        let b = eval.graph().lookup("b").unwrap();
        let c = eval.graph().lookup("c").unwrap();
        assert_eq!(eval.graph()[b].dirty_state(), DirtyState::Dirty);
        assert_eq!(
            eval.graph()[c].dirty_state(),
            DirtyState::MaybeDirty
        );

        eval.end_operation();
        assert!(eval.stale_nodes().is_empty());
        assert_eq!(int(&mut eval, "c"), 5);
    }

    #[test]
    fn unchanged_intermediate_stops_propagation() {
        let runs = Rc::new(std::cell::Cell::new(0));
        let runs_clone = Rc::clone(&runs);
        let mut eval = evaluator(
            Declarations::new()
                .value("n", 3)
                .derived("parity", |acc| {
                    Ok(Value::from(acc.get("n")?.as_i64().unwrap_or(0) % 2))
                })
                .derived("label", move |acc| {
                    runs_clone.set(runs_clone.get() + 1);
                    acc.get("parity")
                }),
        );
        assert_eq!(int(&mut eval, "label"), 1);

        eval.set("n", Value::from(5)).unwrap();
        eval.end_operation();

        assert_eq!(runs.get(), 1);
        assert_eq!(int(&mut eval, "label"), 1);
    }

    #[test]
    fn cycle_reports_stack_from_first_repeat() {
        let mut eval = evaluator(
            Declarations::new()
                .derived("tick", |acc| acc.get("tock"))
                .derived("tock", |acc| acc.get("tick")),
        );

        assert_eq!(eval.get("tick").unwrap(), None);
        let record = eval.fatal().unwrap();
        assert_eq!(
            record.error,
            FatalError::CircularDependency {
                stack: vec!["tick".into(), "tock".into(), "tick".into()]
            }
        );
    }

    #[test]
    fn writes_after_fatal_are_rejected() {
        let mut eval = evaluator(
            Declarations::new()
                .value("a", 1)
                .derived("bad", |acc| acc.get("missing")),
        );
        let _ = eval.get("bad");
        assert!(eval.fatal().is_some());
        assert_eq!(eval.set("a", Value::from(2)), Err(EngineError::Halted));
    }

    #[test]
    fn external_write_to_derived_is_illegal() {
        let mut eval = evaluator(Declarations::new().derived("d", |_| Ok(Value::Null)));

        let err = eval.set("d", Value::from(1)).unwrap_err();
        assert_eq!(
            err,
            EngineError::Fatal(FatalError::IllegalWrite {
                writer: EXTERNAL_WRITER.into(),
                target: "d".into(),
            })
        );
    }

    #[test]
    fn extend_rejects_duplicates_atomically() {
        let mut eval = evaluator(Declarations::new().value("a", 1));
        let err = eval
            .extend(Declarations::new().value("b", 2).value("a", 3))
            .unwrap_err();

        assert_eq!(err, EngineError::DuplicateName("a".into()));
        assert!(eval.graph().lookup("b").is_none());
    }

    #[test]
    fn fatal_is_reported_once() {
        let mut eval = evaluator(Declarations::new().derived("bad", |_| Err("boom".into())));
        let _ = eval.get("bad");
        eval.end_operation();
        eval.end_operation();

        let fatal_events = eval
            .take_outgoing()
            .into_iter()
            .filter(|o| matches!(o, Outgoing::Fatal(_)))
            .count();
        assert_eq!(fatal_events, 1);
    }
}
