//! Components - the live entity instances handlers read and mutate.
//!
//! Construction and lookup of components is the container layer's job. The
//! core only needs a slot per component type: somewhere to find the live
//! instance when an [`AtomicModify`](crate::AtomicModify) arrives, and a
//! moment (activation) at which collaborators such as the version store can
//! start tracking it.

use std::any::{type_name, Any, TypeId};
use std::cell::{BorrowError, BorrowMutError, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::ViridError;

/// Identity of a component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey {
    type_id: TypeId,
    name: &'static str,
}

impl ComponentKey {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Component Handle
// =============================================================================

/// Shared handle to a live component instance.
///
/// Clones point at the same instance. Handlers capture handles to the
/// components they declared as params.
pub struct Component<T> {
    cell: Rc<RefCell<T>>,
}

impl<T: 'static> Component<T> {
    /// Wrap a value in a fresh, unbound handle.
    pub fn new(value: T) -> Self {
        Self {
            cell: Rc::new(RefCell::new(value)),
        }
    }

    pub(crate) fn from_cell(cell: Rc<RefCell<T>>) -> Self {
        Self { cell }
    }

    pub fn key(&self) -> ComponentKey {
        ComponentKey::of::<T>()
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.cell.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.cell.borrow_mut()
    }

    pub fn try_borrow(&self) -> Result<Ref<'_, T>, BorrowError> {
        self.cell.try_borrow()
    }

    pub fn try_borrow_mut(&self) -> Result<RefMut<'_, T>, BorrowMutError> {
        self.cell.try_borrow_mut()
    }

    /// Read the component through a closure.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.cell.borrow())
    }

    /// Mutate the component through a closure.
    ///
    /// Direct mutation bypasses the version store's dirty tracking; inside
    /// handlers prefer declaring the component as a param or sending an
    /// `AtomicModify`.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.cell.borrow_mut())
    }

    /// Whether two handles share one instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn erased(&self) -> Rc<dyn Any> {
        self.cell.clone()
    }

    fn into_slot(self) -> Rc<dyn Slot> {
        self.cell
    }
}

impl<T> Clone for Component<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Component<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.try_borrow() {
            Ok(value) => f.debug_tuple("Component").field(&*value).finish(),
            Err(_) => f.write_str("Component(<borrowed>)"),
        }
    }
}

// =============================================================================
// Type-Erased Slots
// =============================================================================

/// A bound component with its type erased.
pub(crate) trait Slot {
    /// Run `f` against the live instance under a mutable borrow.
    fn modify(&self, f: &dyn Fn(&mut dyn Any) -> anyhow::Result<()>) -> anyhow::Result<()>;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: 'static> Slot for RefCell<T> {
    fn modify(&self, f: &dyn Fn(&mut dyn Any) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut guard = self
            .try_borrow_mut()
            .map_err(|_| ViridError::ComponentBusy {
                component: type_name::<T>(),
            })?;
        f(&mut *guard)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Hook run when a component is bound.
///
/// Receives the component key and the erased `Rc<RefCell<T>>`.
pub type ActivationHook = dyn Fn(ComponentKey, Rc<dyn Any>) -> anyhow::Result<()>;

/// Component slots, one per type.
#[derive(Default)]
pub(crate) struct Components {
    slots: HashMap<ComponentKey, Rc<dyn Slot>>,
    activation_hooks: Vec<Rc<ActivationHook>>,
}

impl Components {
    /// Bind `value` as the component of type `T`.
    ///
    /// Activation hooks are returned rather than run so the caller can invoke
    /// them without holding a borrow of the slot table.
    pub fn bind<T: 'static>(
        &mut self,
        value: T,
    ) -> Result<(Component<T>, Vec<Rc<ActivationHook>>), ViridError> {
        let key = ComponentKey::of::<T>();
        if self.slots.contains_key(&key) {
            return Err(ViridError::ComponentAlreadyBound {
                component: key.name(),
            });
        }

        let component = Component::new(value);
        self.slots.insert(key, component.clone().into_slot());
        Ok((component, self.activation_hooks.clone()))
    }

    pub fn get<T: 'static>(&self) -> Option<Component<T>> {
        let slot = self.slots.get(&ComponentKey::of::<T>())?.clone();
        slot.into_any()
            .downcast::<RefCell<T>>()
            .ok()
            .map(Component::from_cell)
    }

    pub fn slot(&self, key: ComponentKey) -> Option<Rc<dyn Slot>> {
        self.slots.get(&key).cloned()
    }

    pub fn erased(&self, key: ComponentKey) -> Option<Rc<dyn Any>> {
        self.slot(key).map(|slot| slot.into_any())
    }

    pub fn add_activation_hook(&mut self, hook: Rc<ActivationHook>) {
        self.activation_hooks.push(hook);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Components")
            .field("bound", &self.slots.keys().collect::<Vec<_>>())
            .field("activation_hooks", &self.activation_hooks.len())
            .finish()
    }
}
