//! Lattice Incr
//!
//! An incremental computation engine. Given named values, some static and
//! some derived by pure functions of other names, it:
//!
//! - Discovers dependencies by watching what each producer reads
//! - Recomputes derived values lazily, in dependency order
//! - Suppresses propagation when a recomputed value is unchanged
//! - Gates evaluation on asynchronous producers
//! - Groups writes into transactions, explicitly or on a timer
//! - Notifies subscribers once per transaction in which a value changed
//! - Backs off dependents of names that are written too often
//!
//! Cycles, illegal writes, unknown names and producer failures put an
//! instance into a terminal Fatal State.
//!
//! # Architecture
//!
//! - `graph`: node arena, dependency extraction, declarations
//! - `eval`: the evaluator and async gate
//! - `change`: equality policies
//! - `batch`: transactions and auto-batching
//! - `subscription`: per-name subscriber lists
//! - `rate`: update-rate backoff
//! - `timer`: clocks and the timer queue
//! - `engine`: the public handle
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use lattice_incr::{Declarations, Engine, Value};
//!
//! let engine = Engine::new(
//!     Declarations::new()
//!         .value("price", 10)
//!         .value("quantity", 3)
//!         .derived("total", |acc| {
//!             let price = acc.get("price")?.as_i64().unwrap_or(0);
//!             let quantity = acc.get("quantity")?.as_i64().unwrap_or(0);
//!             Ok(Value::from(price * quantity))
//!         }),
//! )
//! .unwrap();
//!
//! let seen = Rc::new(Cell::new(0));
//! let seen_clone = Rc::clone(&seen);
//! let subscription = engine
//!     .subscribe("total", move |v| seen_clone.set(v.as_i64().unwrap_or(0)))
//!     .unwrap();
//! assert_eq!(seen.get(), 30);
//!
//! engine
//!     .batch(|| {
//!         engine.set("price", 20).unwrap();
//!         engine.set("quantity", 4).unwrap();
//!     })
//!     .unwrap();
//! assert_eq!(seen.get(), 80);
//!
//! subscription.unsubscribe();
//! ```

pub mod graph;

mod batch;
mod change;
mod config;
mod engine;
mod error;
mod eval;
mod inspect;
mod rate;
mod subscription;
mod timer;
mod value;

pub use change::{deep_equal, ChangeDetector, EqualityPolicy};
pub use config::{AutoBatchConfig, DeepEqualConfig, EngineConfig, RateLimitConfig};
pub use engine::{Engine, EngineBuilder};
pub use error::{ComputeError, EngineError, FatalError, FatalRecord, EXTERNAL_WRITER};
pub use graph::{Accessor, Declaration, Declarations, DirtyState, NodeKind, Output, Producer, Settler};
pub use inspect::{NodeChange, NodeState, Snapshot, TraceEvent};
pub use rate::RateWindow;
pub use subscription::{SubscriberId, Subscription};
pub use timer::{Clock, ManualClock, SystemClock, TokioClock};
pub use value::{ListRef, MapRef, Value};
