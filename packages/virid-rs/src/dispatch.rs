//! Dispatcher - batches messages into ticks and runs their systems.
//!
//! # Tick Lifecycle
//!
//! ```text
//! dispatch(msg) ─► middleware ─► hub.push ─► mark_dirty ─► tick()
//!                                                            │
//!                              Idle + dirty: schedule body ◄─┘
//!                                                            │
//!        boundary (App::flush) ─► before-tick hooks          │
//!                                 hub.flip                   │
//!                                 snapshot + clear dirty     │
//!                                 collect tasks, sort        │
//!                                 execute tasks              │
//!                                 clear processed entries    │
//!                                 Idle                       │
//!                                   ├─ dirty again ─► tick() (same chain)
//!                                   └─ settled ─► after-tick hooks, global_tick += 1
//! ```
//!
//! Every message emitted while a body runs lands in staging and is picked up
//! by an immediate re-tick of the same chain, so a whole reaction chain shares
//! one `global_tick`.
//!
//! # Deadlock Guard
//!
//! Each body of a chain increments the re-entrant depth. A chain deeper than
//! [`MAX_REENTRANT_DEPTH`] is treated as a runaway feedback loop: every pending
//! message is **discarded**, the hub is reset, and one
//! [`ViridError::Deadlock`] is reported on the error channel. This is a
//! deliberate data-loss safety valve, not a cancellation API.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::Map;
use tracing::{debug, debug_span, error, trace};

use crate::error::ViridError;
use crate::hooks::{ExecuteContext, ExecuteHook, ExecuteHookFn, Hooks, MessageFilter, Stage, TickContext, TickHookFn};
use crate::hub::EventHub;
use crate::message::{Discipline, Envelope, ErrorMessage, MessageKey};
use crate::middleware::{MiddlewareFn, Pipeline};
use crate::registry::Registry;
use crate::system::{catch_panic, panic_message, Completion, Payload, System, SystemId};

/// Maximum number of bodies in one re-entrant tick chain.
pub const MAX_REENTRANT_DEPTH: u32 = 100;

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    Idle,
    /// A body is scheduled or running.
    Running,
}

/// A failure caught at a task or hook boundary, waiting to be reported.
pub(crate) struct Failure {
    pub error: anyhow::Error,
    pub context: String,
}

/// A pending asynchronous system result, with its after-hooks attached.
pub(crate) type Deferred = LocalBoxFuture<'static, Vec<Failure>>;

#[derive(Default)]
struct DirtySet {
    coalesced: Vec<MessageKey>,
    ordered: Vec<Envelope>,
}

impl DirtySet {
    fn mark(&mut self, envelope: Envelope) {
        match envelope.discipline() {
            Discipline::Coalesced => {
                if !self.coalesced.contains(&envelope.key()) {
                    self.coalesced.push(envelope.key());
                }
            }
            Discipline::Ordered => self.ordered.push(envelope),
        }
    }

    fn is_empty(&self) -> bool {
        self.coalesced.is_empty() && self.ordered.is_empty()
    }
}

struct Task {
    system: System,
    priority: i32,
    payload: Payload,
}

/// The scheduler: owns the hub, the registry, hooks and middleware.
///
/// Single-threaded. All state sits behind `Cell`/`RefCell` and no borrow is
/// held while user code (systems, hooks, middleware) runs, so user code may
/// dispatch, register and unregister freely.
pub struct Dispatcher {
    hub: RefCell<EventHub>,
    registry: RefCell<Registry>,
    hooks: RefCell<Hooks>,
    pipeline: RefCell<Pipeline>,
    dirty: RefCell<DirtySet>,
    state: Cell<TickState>,
    scheduled: Cell<bool>,
    global_tick: Cell<u64>,
    depth: Cell<u32>,
    chain: RefCell<Option<TickContext>>,
    deferred: RefCell<Vec<Deferred>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            hub: RefCell::new(EventHub::new()),
            registry: RefCell::new(Registry::new()),
            hooks: RefCell::new(Hooks::default()),
            pipeline: RefCell::new(Pipeline::default()),
            dirty: RefCell::new(DirtySet::default()),
            state: Cell::new(TickState::Idle),
            scheduled: Cell::new(false),
            global_tick: Cell::new(0),
            depth: Cell::new(0),
            chain: RefCell::new(None),
            deferred: RefCell::new(Vec::new()),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register(&self, system: System, priority: i32) -> Result<(), ViridError> {
        self.registry.borrow_mut().register(system, priority)
    }

    pub fn unregister(&self, key: MessageKey, id: SystemId) -> bool {
        self.registry.borrow_mut().unregister(key, id)
    }

    pub(crate) fn add_execute_hook(
        &self,
        stage: Stage,
        filter: MessageFilter,
        hook: Rc<ExecuteHookFn>,
        front: bool,
    ) {
        self.hooks
            .borrow_mut()
            .add_execute(stage, ExecuteHook { filter, hook }, front);
    }

    pub(crate) fn add_tick_hook(&self, stage: Stage, hook: Rc<TickHookFn>, front: bool) {
        self.hooks.borrow_mut().add_tick(stage, hook, front);
    }

    pub(crate) fn add_middleware(&self, layer: Rc<MiddlewareFn>, front: bool) {
        self.pipeline.borrow_mut().add(layer, front);
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Run `envelope` through middleware, then store it and schedule a tick.
    ///
    /// Returns `Ok` when a middleware layer swallows the message.
    pub fn dispatch(&self, envelope: Envelope) -> Result<(), ViridError> {
        let pipeline = self.pipeline.borrow().clone();
        let outcome = RefCell::new(Ok(()));

        pipeline.run(&envelope, &|envelope: &Envelope| {
            *outcome.borrow_mut() = self.accept(envelope.clone());
        });

        outcome.into_inner()
    }

    fn accept(&self, envelope: Envelope) -> Result<(), ViridError> {
        let key = envelope.key();
        if !self.registry.borrow().contains(&key) {
            error!(message = key.name(), "dispatched message has no registered system");
            return Err(ViridError::NoSystemRegistered {
                message: key.name(),
            });
        }

        self.hub.borrow_mut().push(envelope.clone());
        self.mark_dirty(envelope);
        self.tick();
        Ok(())
    }

    fn mark_dirty(&self, envelope: Envelope) {
        self.dirty.borrow_mut().mark(envelope);
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedule a tick body if idle and something is dirty.
    pub fn tick(&self) {
        if self.state.get() == TickState::Running || self.dirty.borrow().is_empty() {
            return;
        }

        let depth = self.depth.get() + 1;
        if depth > MAX_REENTRANT_DEPTH {
            self.abort_deadlock();
            return;
        }

        self.depth.set(depth);
        self.state.set(TickState::Running);
        self.scheduled.set(true);
    }

    /// Run the scheduled body, if any. Returns whether one ran.
    pub fn run_scheduled(&self) -> bool {
        if !self.scheduled.replace(false) {
            return false;
        }
        self.run_tick_body();
        true
    }

    fn abort_deadlock(&self) {
        error!(
            limit = MAX_REENTRANT_DEPTH,
            "re-entrant tick depth exceeded, discarding all pending messages"
        );

        *self.dirty.borrow_mut() = DirtySet::default();
        self.hub.borrow_mut().reset();
        self.chain.borrow_mut().take();
        self.scheduled.set(false);
        self.state.set(TickState::Idle);
        self.depth.set(0);

        self.report(Failure {
            error: ViridError::Deadlock {
                limit: MAX_REENTRANT_DEPTH,
            }
            .into(),
            context: "dispatcher".to_string(),
        });
    }

    fn run_tick_body(&self) {
        let tick = self.global_tick.get();
        let _span = debug_span!("tick", tick, depth = self.depth.get()).entered();

        if self.chain.borrow().is_none() {
            *self.chain.borrow_mut() = Some(TickContext::start(tick));
        }
        self.run_tick_hooks(Stage::Before);

        self.hub.borrow_mut().flip();
        let dirty = mem::take(&mut *self.dirty.borrow_mut());

        let tasks = self.collect_tasks(&dirty);
        trace!(tasks = tasks.len(), "executing tasks");
        for task in tasks {
            self.execute(task, tick);
        }

        {
            let mut hub = self.hub.borrow_mut();
            hub.clear_coalesced(&dirty.coalesced);
            hub.clear_ordered();
        }
        self.state.set(TickState::Idle);

        if !self.dirty.borrow().is_empty() {
            self.tick();
            return;
        }

        // the chain has settled; anything after-hooks dispatch starts a new one
        self.depth.set(0);
        self.run_tick_hooks(Stage::After);
        self.chain.borrow_mut().take();
        self.global_tick.set(tick + 1);
        debug!(tick, "tick settled");
    }

    fn run_tick_hooks(&self, stage: Stage) {
        let hooks = self.hooks.borrow().tick_hooks(stage);
        if hooks.is_empty() {
            return;
        }

        let mut context = self
            .chain
            .borrow_mut()
            .take()
            .unwrap_or_else(|| TickContext::start(self.global_tick.get()));

        let mut failures = Vec::new();
        for hook in hooks {
            if let Err(error) = catch_panic(|| hook(&mut context)) {
                failures.push(Failure {
                    error,
                    context: format!("{stage:?} tick hook failed"),
                });
            }
        }

        *self.chain.borrow_mut() = Some(context);
        for failure in failures {
            self.report(failure);
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    fn collect_tasks(&self, dirty: &DirtySet) -> Vec<Task> {
        let registry = self.registry.borrow();
        let hub = self.hub.borrow();
        let mut tasks = Vec::new();

        for envelope in &dirty.ordered {
            for entry in registry.systems_for(&envelope.key()) {
                tasks.push(Task {
                    system: entry.system.clone(),
                    priority: entry.priority,
                    payload: Payload::Single(envelope.clone()),
                });
            }
        }

        for key in &dirty.coalesced {
            let instances = hub.peek_coalesced(key);
            if instances.is_empty() {
                continue;
            }
            let batch: Rc<[Envelope]> = instances.into();

            // registry keeps system ids unique per key, so one task each
            for entry in registry.systems_for(key) {
                tasks.push(Task {
                    system: entry.system.clone(),
                    priority: entry.priority,
                    payload: Payload::Batch(batch.clone()),
                });
            }
        }

        // stable: ordered before coalesced, then registration order
        tasks.sort_by_key(|task| Reverse(task.priority));
        tasks
    }

    fn execute(&self, task: Task, tick: u64) {
        let Task {
            system, payload, ..
        } = task;
        let system_context = system.shared_context();
        let label = system_context.label();
        let mut context = ExecuteContext {
            system: system_context,
            tick,
            payload: Map::new(),
        };

        let (before, after) = {
            let hooks = self.hooks.borrow();
            (
                hooks.execute_hooks(Stage::Before, &payload),
                hooks.execute_hooks(Stage::After, &payload),
            )
        };

        let mut failures = run_execute_hooks(&before, &payload, &mut context);

        let handler = system.handler().clone();
        match catch_panic(|| handler(&payload)) {
            Ok(Completion::Ready) => {
                failures.extend(run_execute_hooks(&after, &payload, &mut context));
            }
            Ok(Completion::Deferred(future)) => {
                self.deferred.borrow_mut().push(Box::pin(async move {
                    let mut failures = Vec::new();
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => failures.push(Failure {
                            error,
                            context: format!("async error in {label}"),
                        }),
                        Err(panic_info) => failures.push(Failure {
                            error: anyhow::anyhow!("panicked: {}", panic_message(&*panic_info)),
                            context: format!("async error in {label}"),
                        }),
                    }
                    failures.extend(run_execute_hooks(&after, &payload, &mut context));
                    failures
                }));
            }
            Err(error) => {
                failures.extend(run_execute_hooks(&after, &payload, &mut context));
                failures.push(Failure {
                    error,
                    context: format!("sync error in {label}"),
                });
            }
        }

        for failure in failures {
            self.report(failure);
        }
    }

    // =========================================================================
    // Error Channel
    // =========================================================================

    /// Send a failure down the error channel.
    pub(crate) fn report(&self, failure: Failure) {
        let Failure { error, context } = failure;
        debug!(context = %context, error = %format!("{error:#}"), "reporting failure");

        if let Err(channel_error) = self.dispatch(Envelope::new(ErrorMessage { error, context })) {
            error!(error = %channel_error, "error channel unavailable, failure dropped");
        }
    }

    pub(crate) fn take_deferred(&self) -> Vec<Deferred> {
        mem::take(&mut *self.deferred.borrow_mut())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of settled ticks so far.
    pub fn global_tick(&self) -> u64 {
        self.global_tick.get()
    }

    pub fn state(&self) -> TickState {
        self.state.get()
    }

    /// Whether a body is waiting for the next boundary.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.borrow().is_empty()
    }

    /// Whether any system listens to `key`.
    pub fn is_registered(&self, key: &MessageKey) -> bool {
        self.registry.borrow().contains(key)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state.get())
            .field("global_tick", &self.global_tick.get())
            .field("depth", &self.depth.get())
            .field("scheduled", &self.scheduled.get())
            .finish_non_exhaustive()
    }
}

fn run_execute_hooks(
    hooks: &[Rc<ExecuteHookFn>],
    payload: &Payload,
    context: &mut ExecuteContext,
) -> Vec<Failure> {
    let mut failures = Vec::new();
    for hook in hooks {
        if let Err(error) = catch_panic(|| hook(payload, &mut *context)) {
            failures.push(Failure {
                error,
                context: format!("execute hook failed around {}", context.system.label()),
            });
        }
    }
    failures
}
