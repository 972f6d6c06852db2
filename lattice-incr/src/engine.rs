//! Engine
//!
//! The public handle to one incremental graph.
//!
//! # Ownership
//!
//! An [`Engine`] is a cheap `Rc` handle; clones share the same instance.
//! The evaluator sits behind a `RefCell` and is borrowed for the length of
//! one operation. User code runs in two places:
//!
//! - Producers run while the evaluator is borrowed. Calling back into the
//!   engine from a producer fails with [`EngineError::Reentrant`] or
//!   [`EngineError::Busy`]; a write from a producer also halts the engine
//!   with an illegal write.
//! - Subscriber callbacks and hooks run after the borrow is released, in
//!   transaction order. They may read, write and subscribe freely; a write
//!   from a callback starts the next transaction.
//!
//! Settlements delivered while the evaluator is borrowed are queued and
//! applied before the current operation returns.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{EngineError, FatalError, FatalRecord};
use crate::eval::{Evaluator, Outgoing, ReentrySlot};
use crate::graph::{Declarations, Settlement, SettlementSink};
use crate::inspect::{NodeState, Snapshot, TraceEvent};
use crate::rate::RateWindow;
use crate::subscription::{Callback, Subscription, SubscriptionRegistry};
use crate::timer::{Clock, SystemClock, TimerScope};
use crate::value::Value;

type TraceHook = Rc<dyn Fn(&TraceEvent)>;
type FatalHook = Rc<dyn Fn(&Snapshot)>;

#[derive(Default)]
struct Hooks {
    trace: Option<TraceHook>,
    fatal: Option<FatalHook>,
}

/// State shared by every clone of an [`Engine`].
struct Shared {
    state: RefCell<Evaluator>,
    inbox: RefCell<VecDeque<Settlement>>,
    outbox: RefCell<VecDeque<Outgoing>>,
    subscriptions: Rc<RefCell<SubscriptionRegistry>>,
    reentry: ReentrySlot,
    hooks: Hooks,
    dispatching: Cell<bool>,
    /// Woken when a timer is scheduled, for [`Engine::drive`].
    wake: Notify,
}

/// Result of one operation, plus the fault it caused if any.
struct Outcome<R> {
    value: R,
    fatal: Option<FatalError>,
}

impl<T> Outcome<Result<T, EngineError>> {
    fn into_result(self) -> Result<T, EngineError> {
        let value = self.value?;
        match self.fatal {
            Some(err) => Err(EngineError::Fatal(err)),
            None => Ok(value),
        }
    }
}

impl Shared {
    /// Run `op` against the evaluator, then commit and dispatch.
    ///
    /// Returns `None` if the evaluator is already borrowed, i.e. a producer
    /// is running.
    fn with_state<R>(&self, op: impl FnOnce(&mut Evaluator) -> R) -> Option<Outcome<R>> {
        let outcome = {
            let mut state = self.state.try_borrow_mut().ok()?;
            let halted = state.fatal().is_some();

            state.run_due_timers(TimerScope::Backoff);
            state.end_operation();
            self.drain_inbox(&mut state);

            let value = op(&mut state);

            self.drain_inbox(&mut state);
            state.end_operation();

            if state.take_timers_scheduled() {
                self.wake.notify_one();
            }
            self.outbox.borrow_mut().extend(state.take_outgoing());

            let fatal = match state.fatal() {
                Some(record) if !halted => Some(record.error.clone()),
                _ => None,
            };
            Outcome { value, fatal }
        };

        self.dispatch();
        Some(outcome)
    }

    fn drain_inbox(&self, state: &mut Evaluator) {
        loop {
            let next = self.inbox.borrow_mut().pop_front();
            let Some(settlement) = next else {
                break;
            };
            state.apply_settlement(settlement);
            state.end_operation();
        }
    }

    /// Deliver queued notifications. Not reentrant: a dispatch started from
    /// a callback leaves its items to the outer loop, keeping order.
    fn dispatch(&self) {
        let Some(_guard) = DispatchGuard::enter(&self.dispatching) else {
            return;
        };

        loop {
            let next = self.outbox.borrow_mut().pop_front();
            let Some(item) = next else {
                break;
            };
            match item {
                Outgoing::Notify { name, value } => {
                    let callbacks = self.subscriptions.borrow().callbacks(&name);
                    for callback in callbacks {
                        callback(&value);
                    }
                }
                Outgoing::Trace(event) => {
                    if let Some(hook) = &self.hooks.trace {
                        hook(&event);
                    }
                }
                Outgoing::Fatal(snapshot) => {
                    if let Some(hook) = &self.hooks.fatal {
                        hook(&snapshot);
                    }
                }
            }
        }
    }
}

impl SettlementSink for Shared {
    fn deliver(&self, settlement: Settlement) {
        self.inbox.borrow_mut().push_back(settlement);
        // Busy means the running operation drains the inbox itself.
        let _ = self.with_state(|_| ());
    }
}

/// Clears the dispatching flag when dropped, even if a callback panics.
struct DispatchGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self { flag })
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// An incremental computation graph.
///
/// # Example
///
/// ```rust
/// use lattice_incr::{Declarations, Engine, Value};
///
/// let engine = Engine::new(
///     Declarations::new()
///         .value("data", Value::Null)
///         .derived("count", |acc| {
///             let data = acc.get("data")?;
///             Ok(Value::from(data.len().unwrap_or(0)))
///         }),
/// )
/// .unwrap();
///
/// engine.set("data", vec![Value::from(1), Value::from(2), Value::from(3)]).unwrap();
/// assert_eq!(engine.get("count"), Some(Value::from(3)));
/// ```
#[derive(Clone)]
pub struct Engine {
    shared: Rc<Shared>,
}

impl Engine {
    /// Build an engine with the default configuration.
    pub fn new(declarations: Declarations) -> Result<Self, EngineError> {
        Self::builder().build(declarations)
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Current value of `name`.
    ///
    /// `None` if the name is unknown, pending, or has never produced a
    /// value. After Fatal State this returns the last value computed
    /// before the fault.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.try_get(name).ok().flatten()
    }

    /// Like [`Engine::get`], but reports why no value was returned.
    pub fn try_get(&self, name: &str) -> Result<Option<Value>, EngineError> {
        self.shared
            .with_state(|state| state.get(name))
            .ok_or_else(|| EngineError::Reentrant(name.to_string()))?
            .into_result()
    }

    /// Write a static name.
    ///
    /// Returns [`EngineError::Fatal`] if this write halted the engine and
    /// [`EngineError::Halted`] if it was already halted.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        let value = value.into();
        match self.shared.with_state(|state| state.set(name, value)) {
            Some(outcome) => outcome.into_result(),
            None => {
                self.shared
                    .reentry
                    .borrow_mut()
                    .get_or_insert_with(|| name.to_string());
                warn!(node = name, "write from inside a running producer");
                Err(EngineError::Reentrant(name.to_string()))
            }
        }
    }

    /// Call `callback` with the current value of `name`, then once per
    /// transaction in which that value changed.
    ///
    /// The immediate call is skipped if `name` has no usable value yet.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> Result<Subscription, EngineError>
    where
        F: Fn(&Value) + 'static,
    {
        let (current, shared_name) = self
            .shared
            .with_state(|state| -> Result<_, EngineError> {
                let current = state.get(name)?;
                let shared_name = state
                    .graph()
                    .lookup(name)
                    .map(|id| state.graph()[id].shared_name())
                    .ok_or_else(|| EngineError::UnknownName(name.to_string()))?;
                Ok((current, shared_name))
            })
            .ok_or_else(|| EngineError::Reentrant(name.to_string()))?
            .into_result()?;

        let callback: Callback = Rc::new(callback);
        let id = self
            .shared
            .subscriptions
            .borrow_mut()
            .subscribe(Rc::clone(&shared_name), Rc::clone(&callback));
        if let Some(value) = current {
            callback(&value);
        }

        Ok(Subscription::new(
            Rc::downgrade(&self.shared.subscriptions),
            shared_name,
            id,
        ))
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Run `f` with every write inside it grouped into one transaction.
    ///
    /// The transaction commits before this returns, so a read right after
    /// observes settled values. Batches nest; only the outermost commits.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R, EngineError> {
        self.shared
            .with_state(Evaluator::open_batch)
            .ok_or(EngineError::Busy)?;

        let mut guard = BatchGuard {
            shared: &self.shared,
            open: true,
        };
        let result = f();
        guard.close()?;
        Ok(result)
    }

    /// Commit a pending auto-batch now. No-op inside an explicit batch.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.shared
            .with_state(|state| -> Result<(), EngineError> {
                state.flush();
                Ok(())
            })
            .ok_or(EngineError::Busy)?
            .into_result()
    }

    /// Add nodes to the graph. New derived nodes start stale.
    pub fn extend(&self, declarations: Declarations) -> Result<(), EngineError> {
        self.shared
            .with_state(|state| state.extend(declarations))
            .ok_or(EngineError::Busy)?
            .into_result()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run auto-flushes and backoff expiries whose deadline has passed.
    ///
    /// Other operations only run due backoff expiries. A pending auto-flush
    /// waits for this call, [`Engine::drive`], [`Engine::flush`] or a read.
    pub fn run_due_timers(&self) {
        let _ = self
            .shared
            .with_state(|state| state.run_due_timers(TimerScope::All));
    }

    /// Time until the next scheduled timer, if any.
    pub fn next_timer_delay(&self) -> Option<Duration> {
        self.shared
            .state
            .try_borrow()
            .ok()
            .and_then(|state| state.next_timer_delay())
    }

    /// Run timers as they come due, forever.
    ///
    /// Spawn this on a tokio `LocalSet` and drop or abort the task to stop.
    /// Pair it with [`crate::TokioClock`] so deadlines follow tokio time.
    pub async fn drive(&self) {
        loop {
            self.run_due_timers();
            match self.next_timer_delay() {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shared.wake.notified() => {}
                    }
                }
                None => self.shared.wake.notified().await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Read-only snapshot of the graph, values, stale set and fatal record.
    pub fn inspect(&self) -> Result<Snapshot, EngineError> {
        let state = self.shared.state.try_borrow().map_err(|_| EngineError::Busy)?;
        Ok(Snapshot::capture(&state))
    }

    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.shared.state.try_borrow().ok()?.node_state(name)
    }

    pub fn fatal(&self) -> Option<FatalRecord> {
        self.shared.state.try_borrow().ok()?.fatal().cloned()
    }

    pub fn is_halted(&self) -> bool {
        self.fatal().is_some()
    }

    pub fn is_stale(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.stale)
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.pending)
    }

    /// Write counter for a static name, once it has been written.
    pub fn rate_window(&self, name: &str) -> Option<RateWindow> {
        self.shared.state.try_borrow().ok()?.rate_window(name)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.shared.subscriptions.borrow().count(name)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Engine");
        if let Ok(state) = self.shared.state.try_borrow() {
            debug
                .field("nodes", &state.graph().len())
                .field("revision", &state.revision())
                .field("halted", &state.fatal().is_some());
        }
        debug.finish_non_exhaustive()
    }
}

/// Closes the batch when dropped, so a panicking batch body doesn't leave
/// the engine batching forever.
struct BatchGuard<'a> {
    shared: &'a Shared,
    open: bool,
}

impl BatchGuard<'_> {
    fn close(&mut self) -> Result<(), EngineError> {
        self.open = false;
        self.shared
            .with_state(|state| -> Result<(), EngineError> {
                state.close_batch();
                Ok(())
            })
            .ok_or(EngineError::Busy)?
            .into_result()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.shared.with_state(Evaluator::close_batch);
        }
    }
}

/// Configures and builds an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Rc<dyn Clock>>,
    hooks: Hooks,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for auto-batch and backoff timers.
    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Called once per committed transaction.
    pub fn on_trace<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TraceEvent) + 'static,
    {
        self.hooks.trace = Some(Rc::new(hook));
        self
    }

    /// Called once, with a snapshot, when the engine enters Fatal State.
    pub fn on_fatal<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Snapshot) + 'static,
    {
        self.hooks.fatal = Some(Rc::new(hook));
        self
    }

    pub fn build(self, declarations: Declarations) -> Result<Engine, EngineError> {
        let clock = self
            .clock
            .unwrap_or_else(|| Rc::new(SystemClock::new()));
        let trace_enabled = self.hooks.trace.is_some();
        let reentry: ReentrySlot = Rc::new(RefCell::new(None));
        let config = self.config;
        let hooks = self.hooks;

        let shared = Rc::new_cyclic(|weak: &Weak<Shared>| {
            let sink: Weak<dyn SettlementSink> = weak.clone();
            Shared {
                state: RefCell::new(Evaluator::new(
                    &config,
                    clock,
                    sink,
                    Rc::clone(&reentry),
                    trace_enabled,
                )),
                inbox: RefCell::new(VecDeque::new()),
                outbox: RefCell::new(VecDeque::new()),
                subscriptions: Rc::new(RefCell::new(SubscriptionRegistry::default())),
                reentry,
                hooks,
                dispatching: Cell::new(false),
                wake: Notify::new(),
            }
        });

        shared.state.borrow_mut().extend(declarations)?;
        Ok(Engine { shared })
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("trace", &self.hooks.trace.is_some())
            .field("fatal", &self.hooks.fatal.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_instance() {
        let engine = Engine::new(Declarations::new().value("a", 1)).unwrap();
        let other = engine.clone();

        other.set("a", 2).unwrap();
        assert_eq!(engine.get("a"), Some(Value::from(2)));
    }

    #[test]
    fn unknown_names_are_reported() {
        let engine = Engine::new(Declarations::new()).unwrap();

        assert_eq!(
            engine.try_get("nope"),
            Err(EngineError::UnknownName("nope".into()))
        );
        assert_eq!(
            engine.set("nope", 1),
            Err(EngineError::UnknownName("nope".into()))
        );
        assert!(engine.subscribe("nope", |_| {}).is_err());
    }

    #[test]
    fn batch_guard_closes_on_panic() {
        let engine = Engine::new(
            Declarations::new()
                .value("a", 1)
                .derived("b", |acc| acc.get("a")),
        )
        .unwrap();
        assert_eq!(engine.get("b"), Some(Value::from(1)));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = engine.batch(|| {
                engine.set("a", 2).unwrap();
                panic!("batch body failed");
            });
        }));
        assert!(result.is_err());

        // The batch was closed and committed.
        engine.set("a", 3).unwrap();
        assert_eq!(engine.get("b"), Some(Value::from(3)));
    }

    #[test]
    fn debug_output_summarises_state() {
        let engine = Engine::new(Declarations::new().value("a", 1)).unwrap();
        let debug = format!("{engine:?}");
        assert!(debug.contains("nodes: 1"));
    }
}
