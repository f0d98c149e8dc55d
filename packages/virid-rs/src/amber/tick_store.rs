//! Macro history: one map of every entity's snapshot per recorded tick.

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::component::ComponentKey;
use crate::error::HistoryError;

use super::entity_store::{EntityStore, Restore};
use super::snapshot::Snapshot;
use super::strategy::RestoreDirection;

pub(crate) type MacroSnapshot = BTreeMap<ComponentKey, Snapshot>;

/// What a travel did: restores to announce and per-entity failures.
pub(crate) struct Travel {
    pub restores: Vec<Restore>,
    pub failures: Vec<HistoryError>,
}

#[derive(Debug)]
pub(crate) struct TickStore {
    history: VecDeque<MacroSnapshot>,
    base_tick: u64,
    current_tick: u64,
    max_len: usize,
}

impl TickStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            history: VecDeque::new(),
            base_tick: 0,
            current_tick: 0,
            max_len,
        }
    }

    /// Record `snapshot` as the newest tick.
    ///
    /// Ticks after the current one are discarded first.
    pub fn update(&mut self, snapshot: MacroSnapshot) {
        let len = self.history.len() as u64;
        if self.current_tick < self.base_tick + len {
            let keep = (self.current_tick - self.base_tick + 1) as usize;
            self.history.truncate(keep);
        }

        self.history.push_back(snapshot);
        if self.history.len() > self.max_len {
            self.history.pop_front();
            self.base_tick += 1;
        }

        self.current_tick = self.max_tick();
        debug!(tick = self.current_tick, "tick recorded");
    }

    /// Bring every entity to its state at `target`.
    ///
    /// Entities whose current snapshot already is the recorded one are left
    /// alone. Restored entities are resealed so their own stacks reflect the
    /// new present. Travel itself does not record a tick.
    pub fn travel(&mut self, target: u64, entities: &mut EntityStore) -> Result<Travel, HistoryError> {
        let index = target
            .checked_sub(self.base_tick)
            .map(|index| index as usize)
            .filter(|index| *index < self.history.len())
            .ok_or(HistoryError::TickOutOfRange {
                tick: target,
                min: self.min_tick(),
                max: self.max_tick(),
            })?;

        let direction = if target < self.current_tick {
            RestoreDirection::Undo
        } else {
            RestoreDirection::Redo
        };

        let mut outcome = Travel {
            restores: Vec::new(),
            failures: Vec::new(),
        };
        for (key, historical) in &self.history[index] {
            let Some(current) = entities.current(*key) else {
                continue;
            };
            if Rc::ptr_eq(&current, historical) {
                continue;
            }

            let restored = entities
                .restore(*key, historical)
                .and_then(|()| entities.seal(*key));
            match restored {
                Ok(_) => outcome.restores.extend(entities.restore_record(
                    *key,
                    current,
                    historical.clone(),
                    direction,
                )),
                Err(e) => {
                    warn!(component = %key, error = %e, "entity could not travel");
                    outcome.failures.push(e);
                }
            }
        }

        self.current_tick = target;
        debug!(tick = target, ?direction, restored = outcome.restores.len(), "travelled");
        Ok(outcome)
    }

    /// Forget every tick and record `snapshot` as tick 0.
    pub fn reset(&mut self, snapshot: MacroSnapshot) {
        self.history.clear();
        self.base_tick = 0;
        self.current_tick = 0;
        self.update(snapshot);
    }

    /// Give recorded ticks that predate `key` its first snapshot.
    pub fn backfill(&mut self, key: ComponentKey, snapshot: &Snapshot) {
        for tick in &mut self.history {
            tick.entry(key).or_insert_with(|| snapshot.clone());
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn min_tick(&self) -> u64 {
        self.base_tick
    }

    pub fn max_tick(&self) -> u64 {
        match self.history.len() as u64 {
            0 => self.base_tick,
            len => self.base_tick + len - 1,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.history.len()
    }
}
