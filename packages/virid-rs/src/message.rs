//! Messages - the typed facts and requests that flow through the dispatcher.
//!
//! Every message type carries a fixed delivery discipline:
//!
//! | Discipline  | Delivery                                             |
//! |-------------|------------------------------------------------------|
//! | `Coalesced` | all instances of the type in one tick, as one batch  |
//! | `Ordered`   | one instance at a time, strictly in emission order   |
//!
//! The discipline is part of the type declaration, so an instance can never
//! change discipline and routing is a match on a closed tag rather than a
//! runtime type hierarchy.
//!
//! # Example
//!
//! ```ignore
//! use virid::{coalesced_message, ordered_message};
//!
//! struct Resized { width: u32 }
//! coalesced_message!(Resized);
//!
//! struct Clicked { x: i32, y: i32 }
//! ordered_message!(Clicked);
//! ```

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::rc::Rc;

use crate::component::{Component, ComponentKey};

// =============================================================================
// Discipline
// =============================================================================

/// How instances of a message type are delivered within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Discipline {
    /// Same-type instances are merged into a single delivery per tick.
    Coalesced,
    /// Each instance is delivered on its own, in arrival order.
    Ordered,
}

/// Marker trait for message types.
///
/// Prefer the [`coalesced_message!`](crate::coalesced_message) and
/// [`ordered_message!`](crate::ordered_message) macros over implementing this
/// by hand.
pub trait Message: Any {
    /// The delivery discipline shared by every instance of this type.
    const DISCIPLINE: Discipline;
}

/// Implement [`Message`] with [`Discipline::Coalesced`] for one or more types.
#[macro_export]
macro_rules! coalesced_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Message for $ty {
                const DISCIPLINE: $crate::Discipline = $crate::Discipline::Coalesced;
            }
        )+
    };
}

/// Implement [`Message`] with [`Discipline::Ordered`] for one or more types.
#[macro_export]
macro_rules! ordered_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Message for $ty {
                const DISCIPLINE: $crate::Discipline = $crate::Discipline::Ordered;
            }
        )+
    };
}

// =============================================================================
// Message Key
// =============================================================================

/// Identity of an exact message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    type_id: TypeId,
    name: &'static str,
}

impl MessageKey {
    /// Key for message type `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            name: type_name::<M>(),
        }
    }

    /// Full type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A type-erased message instance plus its routing metadata.
///
/// Cloning an envelope shares the instance; handlers only ever see it by
/// reference.
#[derive(Clone)]
pub struct Envelope {
    key: MessageKey,
    discipline: Discipline,
    payload: Rc<dyn Any>,
}

impl Envelope {
    /// Wrap a message instance.
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            key: MessageKey::of::<M>(),
            discipline: M::DISCIPLINE,
            payload: Rc::new(message),
        }
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Check whether the instance is of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.payload.is::<M>()
    }

    /// Borrow the instance as `M`, if it is one.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("key", &self.key)
            .field("discipline", &self.discipline)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Built-in Messages
// =============================================================================

/// Error report travelling on the error channel.
///
/// Handler failures, hook failures and fatal scheduler errors all arrive here.
pub struct ErrorMessage {
    pub error: anyhow::Error,
    pub context: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<anyhow::Error>, context: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            context: context.into(),
        }
    }
}

impl fmt::Debug for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMessage")
            .field("context", &self.context)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

/// Warning report travelling on the warn channel.
#[derive(Debug, Clone)]
pub struct WarnMessage {
    pub context: String,
}

impl WarnMessage {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

type Recipe = Box<dyn Fn(&mut dyn Any) -> anyhow::Result<()>>;

/// The privileged channel for direct component mutation.
///
/// The built-in modifier system applies the recipe to the bound component of
/// the target type. Anything observing `AtomicModify` (the version store, for
/// one) knows which component changed without inspecting the recipe.
pub struct AtomicModify {
    target: ComponentKey,
    recipe: Recipe,
    label: String,
}

impl AtomicModify {
    /// Build a modification of component type `T`.
    pub fn new<T: 'static>(recipe: impl Fn(&mut T) + 'static, label: impl Into<String>) -> Self {
        let target = ComponentKey::of::<T>();
        Self {
            target,
            recipe: Box::new(move |any: &mut dyn Any| {
                let component = any.downcast_mut::<T>().ok_or_else(|| {
                    anyhow::anyhow!("atomic modify target is not a {}", target.name())
                })?;
                recipe(component);
                Ok(())
            }),
            label: label.into(),
        }
    }

    pub fn target(&self) -> ComponentKey {
        self.target
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the recipe against a live component.
    pub(crate) fn apply_to(&self, component: &mut dyn Any) -> anyhow::Result<()> {
        (self.recipe)(component)
    }

    /// Run the recipe against a typed component handle.
    pub fn apply<T: 'static>(&self, component: &Component<T>) -> anyhow::Result<()> {
        let mut guard = component
            .try_borrow_mut()
            .map_err(|_| anyhow::anyhow!("component {} is borrowed elsewhere", self.target))?;
        self.apply_to(&mut *guard)
    }
}

impl fmt::Debug for AtomicModify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicModify")
            .field("target", &self.target)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

ordered_message!(ErrorMessage, WarnMessage, AtomicModify);

#[cfg(test)]
mod tests {
    use super::*;

    struct Resized;
    coalesced_message!(Resized);

    struct Clicked(u32);
    ordered_message!(Clicked);

    #[test]
    fn envelope_carries_discipline_of_its_type() {
        let resized = Envelope::new(Resized);
        let clicked = Envelope::new(Clicked(3));

        assert_eq!(resized.discipline(), Discipline::Coalesced);
        assert_eq!(clicked.discipline(), Discipline::Ordered);
        assert_eq!(clicked.key(), MessageKey::of::<Clicked>());
        assert_ne!(clicked.key(), resized.key());
    }

    #[test]
    fn envelope_downcasts_only_to_its_own_type() {
        let clicked = Envelope::new(Clicked(7));

        assert!(clicked.is::<Clicked>());
        assert!(!clicked.is::<Resized>());
        assert_eq!(clicked.downcast_ref::<Clicked>().map(|c| c.0), Some(7));
        assert!(clicked.downcast_ref::<Resized>().is_none());
    }

    #[test]
    fn built_in_reports_are_ordered() {
        assert_eq!(ErrorMessage::DISCIPLINE, Discipline::Ordered);
        assert_eq!(WarnMessage::DISCIPLINE, Discipline::Ordered);
        assert_eq!(AtomicModify::DISCIPLINE, Discipline::Ordered);
    }

    #[test]
    fn atomic_modify_applies_recipe_to_matching_component() {
        let counter = Component::new(1_i32);
        let modify = AtomicModify::new::<i32>(|n| *n += 41, "answer");

        modify.apply(&counter).unwrap();

        assert_eq!(*counter.borrow(), 42);
        assert_eq!(modify.label(), "answer");
        assert_eq!(modify.target(), ComponentKey::of::<i32>());
    }

    #[test]
    fn atomic_modify_rejects_wrong_component_type() {
        let modify = AtomicModify::new::<i32>(|n| *n += 1, "bump");
        let mut wrong = String::from("nope");

        let err = modify.apply_to(&mut wrong).unwrap_err();

        assert!(err.to_string().contains("i32"));
    }
}
