//! Dependency Extraction
//!
//! A producer never sees the graph directly. It receives an [`Accessor`]
//! whose `get` both returns a value and records the read. The set of names
//! read during a run becomes the node's dependency set, replacing the set
//! from the previous run.
//!
//! # Approximation
//!
//! Only the branch a conditional producer took most recently is tracked.
//! A name read only on the other branch is not a dependency until the
//! producer takes that branch again.
//!
//! # Deferred values
//!
//! A producer that cannot finish synchronously asks for a [`Settler`]
//! through [`Accessor::defer`] and returns [`Output::Pending`]. The node
//! then holds a pending marker until the settler delivers.

use std::fmt;
use std::rc::{Rc, Weak};

use super::node::{Dependencies, NodeId};
use crate::error::{ComputeError, FatalError};
use crate::eval::{Evaluator, Resolution};
use crate::value::Value;

/// What a producer run yields.
#[derive(Debug, Clone)]
pub enum Output {
    Ready(Value),
    /// The value arrives later through a [`Settler`], or was staged with a
    /// self-write during the run.
    Pending,
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Ready(value)
    }
}

type ProducerFn = dyn Fn(&mut Accessor<'_>) -> Result<Output, ComputeError>;

/// A pure function of other named values.
#[derive(Clone)]
pub struct Producer(Rc<ProducerFn>);

impl Producer {
    /// A synchronous producer.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Accessor<'_>) -> Result<Value, ComputeError> + 'static,
    {
        Self(Rc::new(move |acc: &mut Accessor<'_>| f(acc).map(Output::Ready)))
    }

    /// A producer that decides per run whether it is ready or pending.
    pub fn with_output<F>(f: F) -> Self
    where
        F: Fn(&mut Accessor<'_>) -> Result<Output, ComputeError> + 'static,
    {
        Self(Rc::new(f))
    }

    /// An asynchronous producer. It receives the settler for this run and
    /// must eventually call [`Settler::settle`] or [`Settler::fail`].
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&mut Accessor<'_>, Settler) -> Result<(), ComputeError> + 'static,
    {
        Self(Rc::new(move |acc: &mut Accessor<'_>| {
            let settler = acc.defer();
            f(acc, settler)?;
            Ok(Output::Pending)
        }))
    }

    pub(crate) fn call(&self, accessor: &mut Accessor<'_>) -> Result<Output, ComputeError> {
        (self.0)(accessor)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Producer(..)")
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// A dependency is waiting on this pending node.
    Blocked(NodeId),
    /// Fatal State was entered.
    Halted,
}

/// Instrumented view of the graph handed to a running producer.
pub struct Accessor<'a> {
    eval: &'a mut Evaluator,
    node: NodeId,
    reads: Dependencies,
    interrupt: Option<Interrupt>,
    staged: Option<Value>,
    deferred: bool,
}

impl<'a> Accessor<'a> {
    /// Name of the node being computed.
    pub fn name(&self) -> &str {
        self.eval.graph().name(self.node)
    }

    /// Read `name`, recording it as a dependency.
    ///
    /// A stale dependency is brought up to date first. Reading a pending
    /// dependency, or one that is waiting on a pending node, interrupts the
    /// run. Reading an unknown name is fatal. Reading the node's own name
    /// returns its previous value and is not a dependency.
    pub fn get(&mut self, name: &str) -> Result<Value, ComputeError> {
        if self.interrupt.is_some() {
            return Err(ComputeError::Interrupted);
        }

        let Some(dep) = self.eval.graph().lookup(name) else {
            let node = self.name().to_string();
            self.eval.raise(FatalError::UnknownDependency {
                node,
                name: name.to_string(),
            });
            return self.interrupted(Interrupt::Halted);
        };

        if dep == self.node {
            return Ok(self.previous().unwrap_or_default());
        }
        if !self.reads.contains(&dep) {
            self.reads.push(dep);
        }

        match self.eval.resolve(dep) {
            Resolution::Ready => Ok(self.eval.graph()[dep].value.clone().unwrap_or_default()),
            Resolution::Blocked(root) => self.interrupted(Interrupt::Blocked(root)),
            Resolution::Halted => self.interrupted(Interrupt::Halted),
        }
    }

    /// Write through the accessor.
    ///
    /// Writing the node's own name stages its value; the staged value is
    /// used if the producer returns [`Output::Pending`] without a settler.
    /// Writing any other name is an illegal write.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ComputeError> {
        if self.interrupt.is_some() {
            return Err(ComputeError::Interrupted);
        }
        if name == self.name() {
            self.staged = Some(value.into());
            return Ok(());
        }

        let writer = self.name().to_string();
        self.eval.raise(FatalError::IllegalWrite {
            writer,
            target: name.to_string(),
        });
        self.interrupted(Interrupt::Halted)
    }

    /// The node's own last committed value. Not a dependency.
    pub fn previous(&self) -> Option<Value> {
        self.eval.graph()[self.node].value.clone()
    }

    /// Request a settler for this run.
    pub fn defer(&mut self) -> Settler {
        self.deferred = true;
        let node = &self.eval.graph()[self.node];
        Settler {
            sink: self.eval.sink(),
            node: self.node,
            name: node.shared_name(),
            generation: node.generation,
            delivered: false,
        }
    }

    fn interrupted<T>(&mut self, interrupt: Interrupt) -> Result<T, ComputeError> {
        self.interrupt = Some(interrupt);
        Err(ComputeError::Interrupted)
    }
}

/// Everything observed during one producer run.
#[derive(Debug)]
pub(crate) struct Extraction {
    pub output: Result<Output, ComputeError>,
    pub reads: Dependencies,
    pub interrupt: Option<Interrupt>,
    pub staged: Option<Value>,
    pub deferred: bool,
}

/// Run `producer` once for `node` against an instrumented accessor.
pub(crate) fn extract(eval: &mut Evaluator, node: NodeId, producer: &Producer) -> Extraction {
    let mut accessor = Accessor {
        eval,
        node,
        reads: Dependencies::new(),
        interrupt: None,
        staged: None,
        deferred: false,
    };
    let output = producer.call(&mut accessor);

    Extraction {
        output,
        reads: accessor.reads,
        interrupt: accessor.interrupt,
        staged: accessor.staged,
        deferred: accessor.deferred,
    }
}

/// Result carried by a settlement.
#[derive(Debug, Clone)]
pub(crate) enum Settled {
    Value(Value),
    Failed(String),
    /// The settler was dropped without delivering.
    Abandoned,
}

/// A deferred result on its way back to the engine.
#[derive(Debug, Clone)]
pub(crate) struct Settlement {
    pub node: NodeId,
    pub generation: u64,
    pub result: Settled,
}

/// Where settlers deliver. Implemented by the engine.
pub(crate) trait SettlementSink {
    fn deliver(&self, settlement: Settlement);
}

/// One-shot handle that delivers a deferred value.
///
/// Only the settler of a node's in-flight run is honoured; any other is
/// ignored. Dropping a settler without delivering releases the pending
/// marker and keeps the node's previous value.
#[must_use = "a pending node stays pending until its settler delivers"]
pub struct Settler {
    sink: Weak<dyn SettlementSink>,
    node: NodeId,
    name: Rc<str>,
    generation: u64,
    delivered: bool,
}

impl Settler {
    /// Name of the node this settler belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settle(mut self, value: impl Into<Value>) {
        self.send(Settled::Value(value.into()));
    }

    /// Fail the deferred computation. This is a compute exception.
    pub fn fail(mut self, message: impl Into<String>) {
        self.send(Settled::Failed(message.into()));
    }

    fn send(&mut self, result: Settled) {
        self.delivered = true;
        if let Some(sink) = self.sink.upgrade() {
            sink.deliver(Settlement {
                node: self.node,
                generation: self.generation,
                result,
            });
        }
    }
}

impl Drop for Settler {
    fn drop(&mut self) {
        if !self.delivered {
            self.send(Settled::Abandoned);
        }
    }
}

impl fmt::Debug for Settler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler")
            .field("node", &self.name)
            .field("generation", &self.generation)
            .finish()
    }
}
