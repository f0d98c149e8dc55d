//! Amber - version history for components.
//!
//! Amber keeps two timelines:
//!
//! - **Entity history**: per component type, a stack of snapshots. `undo`,
//!   `redo` and `seek` move one component through its own versions.
//! - **Tick history**: after every tick in which a tracked component changed,
//!   a map of every component's current snapshot. `undo_tick` and `redo_tick`
//!   move all components together.
//!
//! # Wiring
//!
//! [`Amber::install`] registers, as the `virid-amber` plugin:
//!
//! 1. an after-execute hook collecting the tracked components a system
//!    declared as params (plus the target of an `AtomicModify`)
//! 2. an after-tick hook sealing those components and recording a tick
//! 3. an activation hook starting a history for each tracked component as it
//!    is bound
//!
//! ```ignore
//! let app = App::new();
//! let amber = Amber::install(&app, AmberConfig::default())?;
//! amber.backup::<Counter>()?;
//!
//! let counter = app.bind_component(Counter::default())?;
//! app.writer().modify::<Counter>(|c| c.count += 10, "add ten")?;
//! app.flush();
//!
//! assert_eq!(amber.version::<Counter>(), 1);
//! amber.undo::<Counter>()?;
//! assert_eq!(counter.borrow().count, 0);
//! ```
//!
//! # Re-entrancy
//!
//! Amber operations must not be nested. Calling into Amber from a backup hook
//! while a seal is running fails with [`HistoryError::Busy`]. Restore hooks
//! are fired after the operation has released the store and may query it.

pub mod snapshot;
pub mod strategy;

mod entity_store;
mod tick_store;

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::app::{App, Plugin, Writer};
use crate::component::{Component, ComponentKey};
use crate::config::AmberConfig;
use crate::error::{HistoryError, ViridError};
use crate::hooks::{ExecuteContext, MessageFilter};
use crate::message::{AtomicModify, ErrorMessage, WarnMessage};
use crate::system::Payload;

use entity_store::{EntityStore, Restore};
use strategy::{Depths, Tracked, TrackedComponent};
use tick_store::TickStore;

pub use snapshot::Snapshot;
pub use strategy::{BackupStrategy, RestoreDirection};

/// Plugin name under which Amber registers its hooks.
pub const AMBER_PLUGIN: &str = "virid-amber";

type Factory = dyn Fn(Rc<dyn Any>) -> Option<Rc<dyn Tracked>>;

struct Store {
    entities: EntityStore,
    ticks: TickStore,
}

impl Store {
    fn record_tick(&mut self) {
        let current = self.entities.current_map();
        self.ticks.update(current);
    }
}

struct AmberInner {
    store: RefCell<Store>,
    dirty: RefCell<BTreeSet<ComponentKey>>,
    declared: RefCell<HashMap<ComponentKey, Rc<Factory>>>,
    config: AmberConfig,
    writer: Writer,
}

/// Handle to the version store installed on one app.
#[derive(Clone)]
pub struct Amber {
    inner: Rc<AmberInner>,
}

impl Amber {
    /// Install the version store on `app`.
    ///
    /// Tick 0 is recorded immediately; components tracked later are
    /// backfilled into it with their initial state.
    pub fn install(app: &App, config: AmberConfig) -> Result<Self, ViridError> {
        config.validate()?;

        let mut store = Store {
            entities: EntityStore::new(config.max_stack_size),
            ticks: TickStore::new(config.max_tick_length),
        };
        store.record_tick();

        let amber = Self {
            inner: Rc::new(AmberInner {
                store: RefCell::new(store),
                dirty: RefCell::new(BTreeSet::new()),
                declared: RefCell::new(HashMap::new()),
                config,
                writer: app.writer(),
            }),
        };

        app.use_plugin(&AmberPlugin {
            inner: amber.inner.clone(),
        })?;
        Ok(amber)
    }

    pub fn config(&self) -> &AmberConfig {
        &self.inner.config
    }

    // =========================================================================
    // Declaration
    // =========================================================================

    /// Track component `T` with the default strategy.
    pub fn backup<T>(&self) -> Result<(), HistoryError>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.backup_with::<T>(BackupStrategy::new())
    }

    /// Track component `T` with a custom strategy.
    ///
    /// If `T` is already bound its history starts now; otherwise it starts
    /// when `T` is bound.
    pub fn backup_with<T>(&self, strategy: BackupStrategy<T>) -> Result<(), HistoryError>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let key = ComponentKey::of::<T>();
        let depths = Depths {
            snapshot: self.inner.config.snapshot_depth,
            diff: self.inner.config.diff_depth,
        };
        let factory: Rc<Factory> = Rc::new(move |erased: Rc<dyn Any>| -> Option<Rc<dyn Tracked>> {
            let cell = erased.downcast::<RefCell<T>>().ok()?;
            Some(Rc::new(TrackedComponent::new(
                Component::from_cell(cell),
                strategy.clone(),
                depths,
            )))
        });
        self.inner.declared.borrow_mut().insert(key, factory.clone());
        debug!(component = %key, "component declared for backup");

        let bound = self
            .inner
            .writer
            .upgrade()
            .and_then(|app| app.erased_component(key));
        match bound {
            Some(erased) if !self.inner.is_tracked(key) => {
                let tracked = factory(erased).ok_or(HistoryError::NotInitialized {
                    component: key.name(),
                })?;
                self.inner.track(tracked)
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Entity History
    // =========================================================================

    /// Current version of `T`; 0 for untracked components.
    ///
    /// The version accessors read 0 (and `can_undo`/`can_redo` read false)
    /// while another Amber operation holds the store, e.g. from inside a
    /// backup or restore hook.
    pub fn version<T: 'static>(&self) -> u64 {
        self.inner
            .read(|store| store.entities.version(ComponentKey::of::<T>()))
            .unwrap_or(0)
    }

    /// Lowest reachable version of `T`.
    pub fn min_version<T: 'static>(&self) -> u64 {
        self.inner
            .read(|store| store.entities.min_version(ComponentKey::of::<T>()))
            .unwrap_or(0)
    }

    /// Highest stored version of `T`, including undone ones.
    pub fn max_version<T: 'static>(&self) -> u64 {
        self.inner
            .read(|store| store.entities.max_version(ComponentKey::of::<T>()))
            .unwrap_or(0)
    }

    /// False for untracked components and while the store is busy.
    pub fn can_undo<T: 'static>(&self) -> bool {
        self.version::<T>() > self.min_version::<T>()
    }

    pub fn can_redo<T: 'static>(&self) -> bool {
        self.version::<T>() < self.max_version::<T>()
    }

    /// Move `T` one version back. Records a tick.
    pub fn undo<T: 'static>(&self) -> Result<bool, HistoryError> {
        if !self.can_undo::<T>() {
            return Ok(false);
        }
        self.seek::<T>(self.version::<T>() - 1)
    }

    /// Move `T` one version forward. Records a tick.
    pub fn redo<T: 'static>(&self) -> Result<bool, HistoryError> {
        if !self.can_redo::<T>() {
            return Ok(false);
        }
        self.seek::<T>(self.version::<T>() + 1)
    }

    /// Restore `T` to `version`. `Ok(false)` if it is out of reach.
    pub fn seek<T: 'static>(&self, version: u64) -> Result<bool, HistoryError> {
        let restore = {
            let mut store = self.inner.store_mut("seek")?;
            let Some(restore) = store.entities.seek(ComponentKey::of::<T>(), version)? else {
                return Ok(false);
            };
            store.record_tick();
            restore
        };
        restore.fire();
        Ok(true)
    }

    /// Seal `T` now instead of at the end of the tick.
    ///
    /// Records a tick when a snapshot was stored.
    pub fn seal<T: 'static>(&self) -> Result<bool, HistoryError> {
        let mut store = self.inner.store_mut("seal")?;
        let sealed = store.entities.seal(ComponentKey::of::<T>())?;
        if sealed {
            store.record_tick();
        }
        Ok(sealed)
    }

    // =========================================================================
    // Tick History
    // =========================================================================

    /// Reads 0 while another Amber operation holds the store.
    pub fn current_tick(&self) -> u64 {
        self.inner
            .read(|store| Some(store.ticks.current_tick()))
            .unwrap_or(0)
    }

    pub fn min_tick(&self) -> u64 {
        self.inner
            .read(|store| Some(store.ticks.min_tick()))
            .unwrap_or(0)
    }

    pub fn max_tick(&self) -> u64 {
        self.inner
            .read(|store| Some(store.ticks.max_tick()))
            .unwrap_or(0)
    }

    pub fn can_undo_tick(&self) -> bool {
        self.current_tick() > self.min_tick()
    }

    pub fn can_redo_tick(&self) -> bool {
        self.current_tick() < self.max_tick()
    }

    /// Move every tracked component one tick back.
    pub fn undo_tick(&self) -> Result<bool, HistoryError> {
        if !self.can_undo_tick() {
            return Ok(false);
        }
        self.travel(self.current_tick() - 1)?;
        Ok(true)
    }

    /// Move every tracked component one tick forward.
    pub fn redo_tick(&self) -> Result<bool, HistoryError> {
        if !self.can_redo_tick() {
            return Ok(false);
        }
        self.travel(self.current_tick() + 1)?;
        Ok(true)
    }

    /// Bring every tracked component to its state at `tick`.
    ///
    /// Per-component failures are reported on the error channel; the rest of
    /// the travel still happens.
    pub fn travel(&self, tick: u64) -> Result<(), HistoryError> {
        let outcome = {
            let mut store = self.inner.store_mut("travel")?;
            let Store { entities, ticks } = &mut *store;
            ticks.travel(tick, entities)?
        };

        for failure in outcome.failures {
            self.inner.report(failure, "amber travel");
        }
        fire_all(outcome.restores);
        Ok(())
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// Forget the tick history and record the present as tick 0.
    ///
    /// Entity histories are kept.
    pub fn reset_tick(&self) -> Result<(), HistoryError> {
        let mut store = self.inner.store_mut("reset_tick")?;
        let current = store.entities.current_map();
        store.ticks.reset(current);
        info!("tick history reset");
        Ok(())
    }

    /// Make the live state of `T` its only version. Records a tick.
    pub fn reset_component<T: 'static>(&self) -> Result<(), HistoryError> {
        let mut store = self.inner.store_mut("reset_component")?;
        store.entities.reset(ComponentKey::of::<T>())?;
        store.record_tick();
        Ok(())
    }

    /// Reset every component and the tick history.
    pub fn reset_all(&self) -> Result<(), HistoryError> {
        let mut store = self.inner.store_mut("reset_all")?;
        for key in store.entities.keys() {
            store.entities.reset(key)?;
        }
        let current = store.entities.current_map();
        store.ticks.reset(current);
        self.inner.dirty.borrow_mut().clear();
        info!("all history reset");
        Ok(())
    }
}

impl std::fmt::Debug for Amber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Amber");
        debug.field("config", &self.inner.config);
        match self.inner.store.try_borrow() {
            Ok(store) => debug
                .field("entities", &store.entities)
                .field("ticks", &store.ticks),
            Err(_) => debug.field("store", &"<busy>"),
        };
        debug.finish()
    }
}

fn fire_all(restores: Vec<Restore>) {
    for restore in restores {
        restore.fire();
    }
}

// =============================================================================
// Internals
// =============================================================================

impl AmberInner {
    fn store_mut(&self, operation: &'static str) -> Result<std::cell::RefMut<'_, Store>, HistoryError> {
        self.store
            .try_borrow_mut()
            .map_err(|_| HistoryError::Busy { operation })
    }

    fn read<R>(&self, f: impl FnOnce(&Store) -> Option<R>) -> Option<R> {
        self.store.try_borrow().ok().and_then(|store| f(&store))
    }

    fn is_tracked(&self, key: ComponentKey) -> bool {
        self.read(|store| Some(store.entities.contains(key)))
            .unwrap_or(false)
    }

    fn track(&self, tracked: Rc<dyn Tracked>) -> Result<(), HistoryError> {
        let key = tracked.key();
        let mut store = self.store_mut("track")?;
        let first = store.entities.init(tracked)?;
        store.ticks.backfill(key, &first);
        Ok(())
    }

    /// After-execute: remember which tracked components the task touched.
    fn collect_dirty(&self, payload: &Payload, context: &ExecuteContext) {
        let Some(sample) = payload.sample() else {
            return;
        };
        if sample.is::<ErrorMessage>() || sample.is::<WarnMessage>() {
            return;
        }

        let declared = self.declared.borrow();
        let mut dirty = self.dirty.borrow_mut();
        let target = sample.downcast_ref::<AtomicModify>().map(AtomicModify::target);
        for key in context.system.params.iter().copied().chain(target) {
            if declared.contains_key(&key) {
                dirty.insert(key);
            }
        }
    }

    /// After-tick: seal dirty components, record a tick if any changed.
    fn seal_dirty(&self) -> Result<(), HistoryError> {
        let dirty = std::mem::take(&mut *self.dirty.borrow_mut());
        if dirty.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        {
            let mut store = self.store_mut("seal")?;
            let mut sealed = false;
            for key in dirty {
                match store.entities.seal(key) {
                    Ok(stored) => sealed |= stored,
                    Err(e) => failures.push(e),
                }
            }
            if sealed {
                store.record_tick();
            }
        }

        for failure in failures {
            self.report(failure, "amber seal");
        }
        Ok(())
    }

    fn report(&self, failure: HistoryError, context: &str) {
        error!(context, error = %failure, "version store failure");
        if let Err(e) = self.writer.error(failure, context) {
            debug!(error = %e, "error channel unavailable");
        }
    }
}

struct AmberPlugin {
    inner: Rc<AmberInner>,
}

impl Plugin for AmberPlugin {
    fn name(&self) -> &'static str {
        AMBER_PLUGIN
    }

    fn install(&self, app: &App) -> anyhow::Result<()> {
        let inner = self.inner.clone();
        app.on_after_execute(
            MessageFilter::All,
            move |payload, context| {
                inner.collect_dirty(payload, context);
                Ok(())
            },
            true,
        );

        let inner = self.inner.clone();
        app.on_after_tick(move |_| Ok(inner.seal_dirty()?), true);

        let inner = self.inner.clone();
        app.add_activation_hook(move |key, erased| {
            let factory = inner.declared.borrow().get(&key).cloned();
            let Some(factory) = factory else {
                return Ok(());
            };
            let tracked = factory(erased).ok_or(HistoryError::NotInitialized {
                component: key.name(),
            })?;
            inner.track(tracked)?;
            Ok(())
        });

        Ok(())
    }
}
