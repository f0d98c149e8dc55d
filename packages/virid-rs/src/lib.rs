//! # Virid
//!
//! A tick-batched message scheduler for component-oriented apps, with a
//! version store that can undo any component or the whole app tick by tick.
//!
//! ## Core Concepts
//!
//! - [`Message`] = a typed fact or request, with a fixed [`Discipline`]
//! - [`System`] = a handler interested in one message type, at a priority
//! - [`Component`] = a live entity instance systems read and mutate
//! - [`Amber`] = snapshot history over tracked components
//!
//! Nothing runs when a message is dispatched. Everything dispatched between
//! two boundaries collapses into one **tick**:
//!
//! | Discipline  | Delivered as                                        |
//! |-------------|-----------------------------------------------------|
//! | `Coalesced` | one batch per system, all instances in arrival order |
//! | `Ordered`   | one call per instance, strictly in emission order    |
//!
//! ## Architecture
//!
//! ```text
//! App::dispatch(msg)
//!     │
//!     ▼
//! middleware ──► EventHub (staging) ──► mark dirty ──► schedule
//!                                                        │
//! App::flush() ◄─────────── boundary ────────────────────┘
//!     │
//!     ▼
//! before-tick hooks
//! flip staging → active
//! tasks sorted by priority ──► before-execute ─► system ─► after-execute
//!     │                                            │
//!     │                  Writer::send(msg) ◄───────┘ (same tick chain)
//!     ▼
//! after-tick hooks ──► Amber seals dirty components, records a tick
//! ```
//!
//! ## Key Invariants
//!
//! 1. **A message's discipline is part of its type** - never decided per instance
//! 2. **Ties keep registration order** - priority sort is stable
//! 3. **Emissions during a tick join the same chain** - one `global_tick` per chain
//! 4. **Failures never unwind out of a tick** - they travel as [`ErrorMessage`]
//! 5. **Runaway chains are cut** - past [`MAX_REENTRANT_DEPTH`] bodies, pending
//!    messages are discarded and a [`ViridError::Deadlock`] is reported
//!
//! ## Example
//!
//! ```ignore
//! use virid::{App, Amber, AmberConfig, System, ordered_message};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Counter { count: i64 }
//!
//! struct Increment(i64);
//! ordered_message!(Increment);
//!
//! let app = App::new();
//! let amber = Amber::install(&app, AmberConfig::default())?;
//! amber.backup::<Counter>()?;
//! let counter = app.bind_component(Counter::default())?;
//!
//! app.register(
//!     System::ordered::<Increment>({
//!         let counter = counter.clone();
//!         move |inc| {
//!             counter.update(|c| c.count += inc.0);
//!             Ok(())
//!         }
//!     })
//!     .named("Counter", "on_increment")
//!     .with_param::<Counter>(),
//!     0,
//! )?;
//!
//! app.dispatch(Increment(2))?;
//! app.flush();
//!
//! amber.undo_tick()?;
//! assert_eq!(counter.borrow().count, 0);
//! ```
//!
//! ## What This Is Not
//!
//! Virid is **not**:
//! - Thread-safe (everything is `Rc`/`RefCell`, one thread drives it)
//! - A persistence layer (snapshots live in memory)
//! - A dependency injection container (components are bound by the host)

// Core modules
mod app;
mod component;
mod dispatch;
mod error;
mod hooks;
mod hub;
mod message;
mod middleware;
mod registry;
mod system;

// Version store
pub mod amber;

pub mod config;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export message types
pub use message::{AtomicModify, Discipline, Envelope, ErrorMessage, Message, MessageKey, WarnMessage};

// Re-export system types
pub use system::{Batch, Completion, Payload, System, SystemContext, SystemId};

// Re-export component types
pub use component::{ActivationHook, Component, ComponentKey};

// Re-export hook types
pub use hooks::{ExecuteContext, ExecuteHookFn, MessageFilter, TickContext, TickHookFn};

// Re-export middleware types
pub use middleware::{MiddlewareFn, Next};

// Re-export scheduler types
pub use dispatch::{Dispatcher, TickState, MAX_REENTRANT_DEPTH};
pub use hub::EventHub;
pub use registry::{Registry, SystemTask};

// Re-export app types (primary entry point)
pub use app::{App, AppBuilder, Plugin, Unregister, Writer, ATOMIC_MODIFY_PRIORITY, REPORT_LOG_PRIORITY};

// Re-export version store types
pub use amber::{Amber, BackupStrategy, RestoreDirection, Snapshot, AMBER_PLUGIN};
pub use config::AmberConfig;

// Re-export error types
pub use error::{HistoryError, ViridError};
