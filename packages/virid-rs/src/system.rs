//! Systems - the handlers that react to messages.
//!
//! A [`System`] pairs a type-erased handler with the data a declarative
//! wiring layer would produce for it: which message type it wants, which
//! discipline it expects, which component types it touches, and a name for
//! diagnostics.
//!
//! # Shapes
//!
//! | Constructor               | Message discipline | Handler receives      |
//! |---------------------------|--------------------|-----------------------|
//! | [`System::ordered`]       | `Ordered`          | `&M`                  |
//! | [`System::coalesced`]     | `Coalesced`        | [`Batch<M>`]          |
//! | [`System::latest`]        | `Coalesced`        | `&M` (newest only)    |
//!
//! Each has an `_async` twin whose closure returns a future. The dispatcher
//! does not wait for it; after-hooks fire when it settles.
//!
//! # Example
//!
//! ```ignore
//! let counter = app.bind_component(Counter::default())?;
//!
//! let system = System::coalesced::<Scrolled>({
//!     let counter = counter.clone();
//!     move |batch| {
//!         counter.update(|c| c.scrolls += batch.len());
//!         Ok(())
//!     }
//! })
//! .named("Counter", "on_scroll")
//! .with_param::<Counter>();
//!
//! app.register(system, 0)?;
//! ```

use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{FutureExt, LocalBoxFuture};
use smallvec::SmallVec;

use crate::component::ComponentKey;
use crate::error::ViridError;
use crate::message::{Discipline, Envelope, Message, MessageKey};

// =============================================================================
// Payload
// =============================================================================

/// What a task hands to its system.
#[derive(Clone, Debug)]
pub enum Payload {
    /// One ordered message.
    Single(Envelope),
    /// Every coalesced instance of one type from this tick.
    Batch(Rc<[Envelope]>),
}

impl Payload {
    /// The message hooks are matched against: the instance itself, or the
    /// first element of a batch.
    pub fn sample(&self) -> Option<&Envelope> {
        self.envelopes().first()
    }

    pub fn envelopes(&self) -> &[Envelope] {
        match self {
            Payload::Single(envelope) => std::slice::from_ref(envelope),
            Payload::Batch(batch) => &batch[..],
        }
    }

    pub fn len(&self) -> usize {
        self.envelopes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes().is_empty()
    }

    /// Borrow the sampled message as `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.sample()?.downcast_ref::<M>()
    }
}

/// Typed view over a coalesced batch, in arrival order.
pub struct Batch<'a, M> {
    envelopes: &'a [Envelope],
    _marker: PhantomData<fn() -> M>,
}

impl<'a, M: Message> Batch<'a, M> {
    fn new(envelopes: &'a [Envelope]) -> Self {
        Self {
            envelopes,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a M> + 'a {
        self.envelopes.iter().filter_map(|e| e.downcast_ref::<M>())
    }

    /// The most recent instance.
    pub fn latest(&self) -> Option<&'a M> {
        self.envelopes.last().and_then(|e| e.downcast_ref::<M>())
    }
}

// =============================================================================
// Completion
// =============================================================================

/// How a handler finished.
pub enum Completion {
    /// Done synchronously.
    Ready,
    /// Still running; settles later.
    Deferred(LocalBoxFuture<'static, anyhow::Result<()>>),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ready => f.write_str("Ready"),
            Completion::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

// =============================================================================
// System Context
// =============================================================================

/// Identity shared by every clone of one [`System`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(u64);

impl SystemId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Declared facts about a system, handed to execute hooks.
#[derive(Debug, Clone)]
pub struct SystemContext {
    /// Owning type, for diagnostics.
    pub owner: &'static str,
    /// Method or function name, for diagnostics.
    pub name: &'static str,
    /// Message type the system is registered for.
    pub message: MessageKey,
    /// Component types the system reads or writes.
    pub params: SmallVec<[ComponentKey; 4]>,
}

impl SystemContext {
    /// `owner::name`, the identity used in error reports.
    pub fn label(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }
}

pub(crate) type Handler = dyn Fn(&Payload) -> anyhow::Result<Completion>;

// =============================================================================
// System
// =============================================================================

/// A handler plus its declared context.
#[derive(Clone)]
pub struct System {
    id: SystemId,
    discipline: Discipline,
    message_discipline: Discipline,
    handler: Rc<Handler>,
    context: Rc<SystemContext>,
}

impl System {
    fn from_handler<M: Message>(discipline: Discipline, handler: Rc<Handler>) -> Self {
        Self {
            id: SystemId::next(),
            discipline,
            message_discipline: M::DISCIPLINE,
            handler,
            context: Rc::new(SystemContext {
                owner: "anonymous",
                name: type_name::<M>(),
                message: MessageKey::of::<M>(),
                params: SmallVec::new(),
            }),
        }
    }

    /// A system receiving each ordered message `M` on its own.
    pub fn ordered<M: Message>(f: impl Fn(&M) -> anyhow::Result<()> + 'static) -> Self {
        Self::from_handler::<M>(
            Discipline::Ordered,
            Rc::new(move |payload: &Payload| -> anyhow::Result<Completion> {
                f(single::<M>(payload)?)?;
                Ok(Completion::Ready)
            }),
        )
    }

    /// Like [`System::ordered`], with an asynchronous body.
    pub fn ordered_async<M, F, Fut>(f: F) -> Self
    where
        M: Message,
        F: Fn(&M) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self::from_handler::<M>(
            Discipline::Ordered,
            Rc::new(move |payload: &Payload| -> anyhow::Result<Completion> {
                Ok(Completion::Deferred(f(single::<M>(payload)?).boxed_local()))
            }),
        )
    }

    /// A system receiving every coalesced `M` of a tick in one call.
    pub fn coalesced<M: Message>(f: impl Fn(Batch<'_, M>) -> anyhow::Result<()> + 'static) -> Self {
        Self::from_handler::<M>(
            Discipline::Coalesced,
            Rc::new(move |payload: &Payload| -> anyhow::Result<Completion> {
                f(batch::<M>(payload)?)?;
                Ok(Completion::Ready)
            }),
        )
    }

    /// Like [`System::coalesced`], with an asynchronous body.
    pub fn coalesced_async<M, F, Fut>(f: F) -> Self
    where
        M: Message,
        F: Fn(Batch<'_, M>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self::from_handler::<M>(
            Discipline::Coalesced,
            Rc::new(move |payload: &Payload| -> anyhow::Result<Completion> {
                Ok(Completion::Deferred(f(batch::<M>(payload)?).boxed_local()))
            }),
        )
    }

    /// A coalesced system that only sees the newest `M` of each tick.
    pub fn latest<M: Message>(f: impl Fn(&M) -> anyhow::Result<()> + 'static) -> Self {
        Self::from_handler::<M>(
            Discipline::Coalesced,
            Rc::new(move |payload: &Payload| -> anyhow::Result<Completion> {
                if let Some(latest) = batch::<M>(payload)?.latest() {
                    f(latest)?;
                }
                Ok(Completion::Ready)
            }),
        )
    }

    /// Set the owner and name used in diagnostics.
    pub fn named(mut self, owner: &'static str, name: &'static str) -> Self {
        let context = Rc::make_mut(&mut self.context);
        context.owner = owner;
        context.name = name;
        self
    }

    /// Declare a component type this system touches.
    pub fn with_param<T: 'static>(mut self) -> Self {
        let key = ComponentKey::of::<T>();
        let context = Rc::make_mut(&mut self.context);
        if !context.params.contains(&key) {
            context.params.push(key);
        }
        self
    }

    pub fn id(&self) -> SystemId {
        self.id
    }

    pub fn message(&self) -> MessageKey {
        self.context.message
    }

    /// Discipline the handler was built for.
    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Discipline declared by the message type itself.
    pub fn message_discipline(&self) -> Discipline {
        self.message_discipline
    }

    pub fn context(&self) -> &SystemContext {
        &self.context
    }

    pub(crate) fn shared_context(&self) -> Rc<SystemContext> {
        self.context.clone()
    }

    pub(crate) fn handler(&self) -> &Rc<Handler> {
        &self.handler
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id)
            .field("name", &self.context.label())
            .field("message", &self.context.message)
            .field("discipline", &self.discipline)
            .finish_non_exhaustive()
    }
}

fn single<M: Message>(payload: &Payload) -> Result<&M, ViridError> {
    match payload {
        Payload::Single(envelope) => {
            envelope
                .downcast_ref::<M>()
                .ok_or(ViridError::MessageTypeMismatch {
                    expected: type_name::<M>(),
                    found: envelope.key().name(),
                })
        }
        Payload::Batch(_) => Err(ViridError::MessageTypeMismatch {
            expected: type_name::<M>(),
            found: "coalesced batch",
        }),
    }
}

fn batch<M: Message>(payload: &Payload) -> Result<Batch<'_, M>, ViridError> {
    match payload {
        Payload::Batch(envelopes) => {
            if let Some(stray) = envelopes.iter().find(|e| !e.is::<M>()) {
                return Err(ViridError::MessageTypeMismatch {
                    expected: type_name::<M>(),
                    found: stray.key().name(),
                });
            }
            Ok(Batch::new(envelopes))
        }
        Payload::Single(envelope) => Err(ViridError::MessageTypeMismatch {
            expected: type_name::<M>(),
            found: envelope.key().name(),
        }),
    }
}

// =============================================================================
// Panic Guard
// =============================================================================

/// Run `f`, turning a panic into an error.
///
/// User code may leave its own state inconsistent after a panic; the
/// dispatcher never touches that state again within the failed call.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic_info) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic_info))),
    }
}

pub(crate) fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Debug)]
    struct Scrolled(i32);
    crate::coalesced_message!(Scrolled);

    #[derive(Debug)]
    struct Pressed(&'static str);
    crate::ordered_message!(Pressed);

    fn batch_of(values: &[i32]) -> Payload {
        let envelopes: Vec<Envelope> = values.iter().map(|v| Envelope::new(Scrolled(*v))).collect();
        Payload::Batch(envelopes.into())
    }

    fn run(system: &System, payload: &Payload) -> anyhow::Result<Completion> {
        (system.handler())(payload)
    }

    #[test]
    fn ordered_system_receives_single_message() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let system = System::ordered::<Pressed>({
            let seen = seen.clone();
            move |p| {
                seen.borrow_mut().push(p.0);
                Ok(())
            }
        });

        run(&system, &Payload::Single(Envelope::new(Pressed("enter")))).unwrap();

        assert_eq!(*seen.borrow(), vec!["enter"]);
        assert_eq!(system.discipline(), Discipline::Ordered);
    }

    #[test]
    fn coalesced_system_receives_batch_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let system = System::coalesced::<Scrolled>({
            let seen = seen.clone();
            move |batch| {
                seen.borrow_mut().extend(batch.iter().map(|s| s.0));
                Ok(())
            }
        });

        run(&system, &batch_of(&[3, 1, 2])).unwrap();

        assert_eq!(*seen.borrow(), vec![3, 1, 2]);
    }

    #[test]
    fn latest_system_sees_only_newest() {
        let seen = Rc::new(Cell::new(0));
        let system = System::latest::<Scrolled>({
            let seen = seen.clone();
            move |s| {
                seen.set(s.0);
                Ok(())
            }
        });

        run(&system, &batch_of(&[5, 6, 9])).unwrap();

        assert_eq!(seen.get(), 9);
    }

    #[test]
    fn wrong_payload_shape_is_a_type_mismatch() {
        let system = System::ordered::<Pressed>(|_| Ok(()));

        let err = run(&system, &batch_of(&[1])).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ViridError>(),
            Some(ViridError::MessageTypeMismatch { .. })
        ));
    }

    #[test]
    fn async_system_returns_deferred_completion() {
        let system = System::ordered_async::<Pressed, _, _>(|_| async { Ok(()) });

        let completion = run(&system, &Payload::Single(Envelope::new(Pressed("x")))).unwrap();

        assert!(matches!(completion, Completion::Deferred(_)));
    }

    #[test]
    fn clones_share_identity_and_builders_keep_params_unique() {
        let system = System::ordered::<Pressed>(|_| Ok(()))
            .named("Keyboard", "on_press")
            .with_param::<u32>()
            .with_param::<u32>();
        let clone = system.clone();

        assert_eq!(system.id(), clone.id());
        assert_ne!(system.id(), System::ordered::<Pressed>(|_| Ok(())).id());
        assert_eq!(system.context().params.len(), 1);
        assert_eq!(system.context().label(), "Keyboard::on_press");
    }

    #[test]
    fn catch_panic_converts_panics_to_errors() {
        let result: anyhow::Result<()> = catch_panic(|| panic!("intentional panic"));

        let err = result.unwrap_err();
        assert!(err.to_string().contains("intentional panic"));
    }

    #[test]
    fn system_records_both_disciplines() {
        let mismatched = System::ordered::<Scrolled>(|_| Ok(()));

        assert_eq!(mismatched.discipline(), Discipline::Ordered);
        assert_eq!(mismatched.message_discipline(), Discipline::Coalesced);
    }

    #[test]
    fn payload_sample_is_first_of_batch() {
        let payload = batch_of(&[4, 5]);

        assert_eq!(payload.downcast_ref::<Scrolled>().map(|s| s.0), Some(4));
        assert_eq!(payload.len(), 2);
    }
}
