//! Registry of systems, keyed by message type.
//!
//! Each message type maps to its systems sorted by priority, highest first.
//! Equal priorities keep registration order, which matters when several
//! systems react to one `AtomicModify` and observe each other's writes.

use std::cmp::Reverse;
use std::collections::HashMap;

use tracing::debug;

use crate::error::ViridError;
use crate::message::MessageKey;
use crate::system::{System, SystemId};

/// A registered system and its priority.
#[derive(Clone, Debug)]
pub struct SystemTask {
    pub system: System,
    pub priority: i32,
}

/// Message type → systems interested in it.
#[derive(Default)]
pub struct Registry {
    interest: HashMap<MessageKey, Vec<SystemTask>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `system` for its message type.
    ///
    /// Fails if the same system (same [`SystemId`]) is already registered for
    /// that type.
    pub fn register(&mut self, system: System, priority: i32) -> Result<(), ViridError> {
        let key = system.message();
        if system.discipline() != system.message_discipline() {
            return Err(ViridError::DisciplineMismatch {
                system: system.context().label(),
                message: key.name(),
                expected: system.discipline(),
                actual: system.message_discipline(),
            });
        }

        let tasks = self.interest.entry(key).or_default();

        if tasks.iter().any(|task| task.system.id() == system.id()) {
            return Err(ViridError::SystemAlreadyRegistered {
                message: key.name(),
                system: system.context().label(),
            });
        }

        debug!(
            message = key.name(),
            system = %system.context().label(),
            priority,
            "system registered"
        );
        tasks.push(SystemTask { system, priority });
        // stable: equal priorities keep registration order
        tasks.sort_by_key(|task| Reverse(task.priority));
        Ok(())
    }

    /// Remove a system. Returns whether it was registered.
    pub fn unregister(&mut self, key: MessageKey, id: SystemId) -> bool {
        let Some(tasks) = self.interest.get_mut(&key) else {
            return false;
        };

        let before = tasks.len();
        tasks.retain(|task| task.system.id() != id);
        let removed = tasks.len() != before;

        if tasks.is_empty() {
            self.interest.remove(&key);
        }
        removed
    }

    /// Systems for a message type, highest priority first.
    pub fn systems_for(&self, key: &MessageKey) -> &[SystemTask] {
        self.interest.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.interest.contains_key(key)
    }

    /// Number of message types with at least one system.
    pub fn len(&self) -> usize {
        self.interest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interest.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("message_types", &self.interest.len())
            .finish_non_exhaustive()
    }
}
