//! Hooks - observe task and tick boundaries without being systems.
//!
//! | Hook             | Fires                                   | Filtered by      |
//! |------------------|-----------------------------------------|------------------|
//! | before-execute   | before each task's system runs          | [`MessageFilter`] |
//! | after-execute    | after each task, success or failure     | [`MessageFilter`] |
//! | before-tick      | at the start of every tick body         | -                |
//! | after-tick       | once a tick's reaction chain is settled | -                |
//!
//! After-execute hooks always fire: on success, on error, on panic, and for
//! deferred systems when the future settles.
//!
//! # Example
//!
//! ```ignore
//! app.on_before_execute(MessageFilter::All, |_, ctx| {
//!     ctx.payload.insert("started".into(), json!(Utc::now().to_rfc3339()));
//!     Ok(())
//! }, false);
//! ```

use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::message::{Discipline, Envelope, Message, MessageKey};
use crate::system::{Payload, SystemContext};

// =============================================================================
// Filters
// =============================================================================

/// Which messages an execute hook is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilter {
    /// Every message.
    All,
    /// Every message of one discipline.
    Discipline(Discipline),
    /// One exact message type.
    Exact(MessageKey),
}

impl MessageFilter {
    pub fn of<M: Message>() -> Self {
        Self::Exact(MessageKey::of::<M>())
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::Discipline(discipline) => envelope.discipline() == *discipline,
            MessageFilter::Exact(key) => envelope.key() == *key,
        }
    }
}

// =============================================================================
// Contexts
// =============================================================================

/// Context shared by the before/after execute hooks of one task.
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    /// The system the task runs.
    pub system: Rc<SystemContext>,
    /// Global tick the task belongs to.
    pub tick: u64,
    /// Scratch space a before-hook can use to hand data to its after-hook.
    pub payload: Map<String, Value>,
}

/// Context shared by the tick hooks of one reaction chain.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub tick: u64,
    /// When the chain started.
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl TickContext {
    pub(crate) fn start(tick: u64) -> Self {
        Self {
            tick,
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }
}

pub type ExecuteHookFn = dyn Fn(&Payload, &mut ExecuteContext) -> anyhow::Result<()>;
pub type TickHookFn = dyn Fn(&mut TickContext) -> anyhow::Result<()>;

#[derive(Clone)]
pub(crate) struct ExecuteHook {
    pub filter: MessageFilter,
    pub hook: Rc<ExecuteHookFn>,
}

// =============================================================================
// Hook Registry
// =============================================================================

/// Where in the task lifecycle an execute hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Before,
    After,
}

#[derive(Default)]
pub(crate) struct Hooks {
    before_execute: Vec<ExecuteHook>,
    after_execute: Vec<ExecuteHook>,
    before_tick: Vec<Rc<TickHookFn>>,
    after_tick: Vec<Rc<TickHookFn>>,
}

fn insert<T>(list: &mut Vec<T>, item: T, front: bool) {
    if front {
        list.insert(0, item);
    } else {
        list.push(item);
    }
}

impl Hooks {
    pub fn add_execute(&mut self, stage: Stage, hook: ExecuteHook, front: bool) {
        match stage {
            Stage::Before => insert(&mut self.before_execute, hook, front),
            Stage::After => insert(&mut self.after_execute, hook, front),
        }
    }

    pub fn add_tick(&mut self, stage: Stage, hook: Rc<TickHookFn>, front: bool) {
        match stage {
            Stage::Before => insert(&mut self.before_tick, hook, front),
            Stage::After => insert(&mut self.after_tick, hook, front),
        }
    }

    /// Execute hooks whose filter matches the payload's sample, in order.
    ///
    /// Empty payloads match nothing.
    pub fn execute_hooks(&self, stage: Stage, payload: &Payload) -> Vec<Rc<ExecuteHookFn>> {
        let Some(sample) = payload.sample() else {
            return Vec::new();
        };
        let list = match stage {
            Stage::Before => &self.before_execute,
            Stage::After => &self.after_execute,
        };
        list.iter()
            .filter(|entry| entry.filter.matches(sample))
            .map(|entry| entry.hook.clone())
            .collect()
    }

    pub fn tick_hooks(&self, stage: Stage) -> Vec<Rc<TickHookFn>> {
        match stage {
            Stage::Before => self.before_tick.clone(),
            Stage::After => self.after_tick.clone(),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_execute", &self.before_execute.len())
            .field("after_execute", &self.after_execute.len())
            .field("before_tick", &self.before_tick.len())
            .field("after_tick", &self.after_tick.len())
            .finish()
    }
}
