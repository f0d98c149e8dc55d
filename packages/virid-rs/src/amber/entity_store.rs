//! Per-entity snapshot stacks.
//!
//! Each tracked component type owns a stack of snapshots, a `bias` counting
//! evictions from the front, and the version currently reflected by the live
//! instance. Logical version `v` lives at physical index `v - bias`.
//!
//! ```text
//!   bias = 3                      version = 5
//!      │                              │
//!      ▼                              ▼
//!    [ v3 ][ v4 ][ v5 ][ v6 ]     seal here prunes v6 first
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::component::ComponentKey;
use crate::error::HistoryError;

use super::snapshot::Snapshot;
use super::strategy::{RestoreDirection, Tracked};

struct EntityHistory {
    stack: VecDeque<Snapshot>,
    bias: u64,
    current: Snapshot,
    version: u64,
    tracked: Rc<dyn Tracked>,
}

impl EntityHistory {
    fn latest(&self) -> u64 {
        self.bias + self.stack.len() as u64 - 1
    }
}

/// A restore that happened, waiting for its `on_restore` hook.
///
/// Hooks are fired once the store is released so they can query it.
pub(crate) struct Restore {
    tracked: Rc<dyn Tracked>,
    old: Snapshot,
    new: Snapshot,
    direction: RestoreDirection,
}

impl Restore {
    pub fn fire(self) {
        self.tracked.on_restore(&self.old, &self.new, self.direction);
    }
}

pub(crate) struct EntityStore {
    entities: BTreeMap<ComponentKey, EntityHistory>,
    max_stack_size: usize,
}

impl EntityStore {
    pub fn new(max_stack_size: usize) -> Self {
        Self {
            entities: BTreeMap::new(),
            max_stack_size,
        }
    }

    /// Start tracking an entity at version 0. Returns its first snapshot.
    pub fn init(&mut self, tracked: Rc<dyn Tracked>) -> Result<Snapshot, HistoryError> {
        let key = tracked.key();
        let snapshot: Snapshot = Rc::new(tracked.serialize()?);

        self.entities.insert(
            key,
            EntityHistory {
                stack: VecDeque::from([snapshot.clone()]),
                bias: 0,
                current: snapshot.clone(),
                version: 0,
                tracked,
            },
        );
        debug!(component = %key, "entity history initialized");
        Ok(snapshot)
    }

    /// Store a new snapshot if the live instance changed.
    ///
    /// Returns whether a snapshot was stored. Sealing after a rollback
    /// discards every version past the current one.
    pub fn seal(&mut self, key: ComponentKey) -> Result<bool, HistoryError> {
        let max_stack_size = self.max_stack_size;
        let history = self.history_mut(key)?;

        if !history.tracked.diff(&history.current)? {
            trace!(component = %key, "seal skipped, no change");
            return Ok(false);
        }

        history.tracked.before_backup(&history.current);
        let snapshot: Snapshot = Rc::new(history.tracked.serialize()?);

        if history.version < history.latest() {
            let keep = (history.version - history.bias + 1) as usize;
            debug!(
                component = %key,
                discarded = history.stack.len() - keep,
                "pruning abandoned branch"
            );
            history.stack.truncate(keep);
        }

        history.stack.push_back(snapshot.clone());
        history.current = snapshot.clone();

        if history.stack.len() > max_stack_size {
            history.stack.pop_front();
            history.bias += 1;
        }

        history.version = history.latest();
        debug!(component = %key, version = history.version, "entity sealed");
        history.tracked.after_backup(&snapshot);
        Ok(true)
    }

    /// Restore the entity to logical version `target`.
    ///
    /// `None` when `target` is outside the reachable window.
    pub fn seek(&mut self, key: ComponentKey, target: u64) -> Result<Option<Restore>, HistoryError> {
        let history = self.history_mut(key)?;

        let index = match target.checked_sub(history.bias) {
            Some(index) if (index as usize) < history.stack.len() => index as usize,
            _ => return Ok(None),
        };

        let old = history.current.clone();
        let new = history.stack[index].clone();
        let direction = if target < history.version {
            RestoreDirection::Undo
        } else {
            RestoreDirection::Redo
        };

        history.tracked.deserialize(&new)?;
        history.current = new.clone();
        history.version = target;
        debug!(component = %key, version = target, ?direction, "entity restored");

        Ok(Some(Restore {
            tracked: history.tracked.clone(),
            old,
            new,
            direction,
        }))
    }

    /// Write `snapshot` into the live instance without touching the stack.
    pub fn restore(&mut self, key: ComponentKey, snapshot: &Snapshot) -> Result<(), HistoryError> {
        self.history_mut(key)?.tracked.deserialize(snapshot)
    }

    /// Drop all history and start over from the live instance as version 0.
    pub fn reset(&mut self, key: ComponentKey) -> Result<Snapshot, HistoryError> {
        let history = self.history_mut(key)?;
        let snapshot: Snapshot = Rc::new(history.tracked.serialize()?);

        history.stack = VecDeque::from([snapshot.clone()]);
        history.bias = 0;
        history.current = snapshot.clone();
        history.version = 0;
        debug!(component = %key, "entity history reset");
        Ok(snapshot)
    }

    /// A [`Restore`] record for `key`, used by the tick store.
    pub fn restore_record(
        &self,
        key: ComponentKey,
        old: Snapshot,
        new: Snapshot,
        direction: RestoreDirection,
    ) -> Option<Restore> {
        self.entities.get(&key).map(|history| Restore {
            tracked: history.tracked.clone(),
            old,
            new,
            direction,
        })
    }

    pub fn current(&self, key: ComponentKey) -> Option<Snapshot> {
        self.entities.get(&key).map(|history| history.current.clone())
    }

    /// Every entity's current snapshot.
    pub fn current_map(&self) -> BTreeMap<ComponentKey, Snapshot> {
        self.entities
            .iter()
            .map(|(key, history)| (*key, history.current.clone()))
            .collect()
    }

    pub fn version(&self, key: ComponentKey) -> Option<u64> {
        self.entities.get(&key).map(|history| history.version)
    }

    /// Lowest reachable version.
    pub fn min_version(&self, key: ComponentKey) -> Option<u64> {
        self.entities.get(&key).map(|history| history.bias)
    }

    /// Highest stored version, including undone ones.
    pub fn max_version(&self, key: ComponentKey) -> Option<u64> {
        self.entities.get(&key).map(EntityHistory::latest)
    }

    pub fn contains(&self, key: ComponentKey) -> bool {
        self.entities.contains_key(&key)
    }

    pub fn keys(&self) -> Vec<ComponentKey> {
        self.entities.keys().copied().collect()
    }

    fn history_mut(&mut self, key: ComponentKey) -> Result<&mut EntityHistory, HistoryError> {
        self.entities
            .get_mut(&key)
            .ok_or(HistoryError::NotInitialized {
                component: key.name(),
            })
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, history) in &self.entities {
            map.entry(
                key,
                &format_args!(
                    "v{} of [{}..={}]",
                    history.version,
                    history.bias,
                    history.latest()
                ),
            );
        }
        map.finish()
    }
}
