//! App - the handle collaborators use to wire and drive the dispatcher.
//!
//! The app owns one [`Dispatcher`] and the component slots. It installs the
//! built-in global systems on construction:
//!
//! | System                    | Message         | Priority |
//! |---------------------------|-----------------|----------|
//! | `virid::atomic_modify`    | `AtomicModify`  | 1000     |
//! | `virid::log_error`        | `ErrorMessage`  | -999     |
//! | `virid::log_warning`      | `WarnMessage`   | -999     |
//!
//! # Driving Ticks
//!
//! Dispatching never runs systems directly. The scheduled tick body runs at
//! the next boundary, which the host reaches by calling [`App::flush`] (or
//! [`App::settle`] when asynchronous systems are in play). Everything
//! dispatched between two boundaries collapses into one tick.
//!
//! ```ignore
//! use virid::{App, System};
//!
//! let app = App::new();
//! let counter = app.bind_component(Counter::default())?;
//!
//! app.register(
//!     System::coalesced::<Scrolled>({
//!         let counter = counter.clone();
//!         move |batch| {
//!             counter.update(|c| c.scrolls += batch.len());
//!             Ok(())
//!         }
//!     })
//!     .with_param::<Counter>(),
//!     0,
//! )?;
//!
//! app.dispatch(Scrolled { dy: 3 })?;
//! app.dispatch(Scrolled { dy: 4 })?;
//! app.flush(); // one tick, one call with both messages
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use crate::component::{Component, ComponentKey, Components};
use crate::dispatch::{Deferred, Dispatcher, Failure, TickState};
use crate::error::ViridError;
use crate::hooks::{ExecuteContext, MessageFilter, Stage, TickContext};
use crate::message::{AtomicModify, Envelope, ErrorMessage, Message, WarnMessage};
use crate::middleware::Next;
use crate::system::{catch_panic, Payload, System};

/// Priority of the built-in `AtomicModify` executor.
pub const ATOMIC_MODIFY_PRIORITY: i32 = 1000;
/// Priority of the built-in error and warning loggers.
pub const REPORT_LOG_PRIORITY: i32 = -999;

// =============================================================================
// Plugins
// =============================================================================

/// A bundle of systems, hooks and middleware installed in one step.
pub trait Plugin {
    /// Unique name; a second install under the same name is rejected.
    fn name(&self) -> &'static str;

    fn install(&self, app: &App) -> anyhow::Result<()>;
}

// =============================================================================
// App
// =============================================================================

pub(crate) struct AppInner {
    dispatcher: Dispatcher,
    components: RefCell<Components>,
    plugins: RefCell<Vec<&'static str>>,
}

/// Cheap-to-clone handle to one dispatcher and its components.
#[derive(Clone)]
pub struct App {
    inner: Rc<AppInner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// An app with the built-in global systems installed.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// Weak handle for systems and hooks that need to emit.
    pub fn writer(&self) -> Writer {
        Writer {
            app: Rc::downgrade(&self.inner),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Dispatch a message. Fails if no system listens to its type.
    pub fn dispatch<M: Message>(&self, message: M) -> Result<(), ViridError> {
        self.inner.dispatcher.dispatch(Envelope::new(message))
    }

    pub fn dispatch_envelope(&self, envelope: Envelope) -> Result<(), ViridError> {
        self.inner.dispatcher.dispatch(envelope)
    }

    /// Register a system. The returned handle removes it again.
    pub fn register(&self, system: System, priority: i32) -> Result<Unregister, ViridError> {
        let key = system.message();
        let id = system.id();
        self.inner.dispatcher.register(system, priority)?;

        let app = Rc::downgrade(&self.inner);
        Ok(Unregister {
            action: Some(Box::new(move || {
                app.upgrade()
                    .map(|inner| inner.dispatcher.unregister(key, id))
                    .unwrap_or(false)
            })),
        })
    }

    pub fn use_middleware(&self, layer: impl Fn(&Envelope, Next<'_>) + 'static, front: bool) {
        self.inner.dispatcher.add_middleware(Rc::new(layer), front);
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    pub fn on_before_execute(
        &self,
        filter: MessageFilter,
        hook: impl Fn(&Payload, &mut ExecuteContext) -> anyhow::Result<()> + 'static,
        front: bool,
    ) {
        self.inner
            .dispatcher
            .add_execute_hook(Stage::Before, filter, Rc::new(hook), front);
    }

    pub fn on_after_execute(
        &self,
        filter: MessageFilter,
        hook: impl Fn(&Payload, &mut ExecuteContext) -> anyhow::Result<()> + 'static,
        front: bool,
    ) {
        self.inner
            .dispatcher
            .add_execute_hook(Stage::After, filter, Rc::new(hook), front);
    }

    pub fn on_before_tick(
        &self,
        hook: impl Fn(&mut TickContext) -> anyhow::Result<()> + 'static,
        front: bool,
    ) {
        self.inner
            .dispatcher
            .add_tick_hook(Stage::Before, Rc::new(hook), front);
    }

    pub fn on_after_tick(
        &self,
        hook: impl Fn(&mut TickContext) -> anyhow::Result<()> + 'static,
        front: bool,
    ) {
        self.inner
            .dispatcher
            .add_tick_hook(Stage::After, Rc::new(hook), front);
    }

    // =========================================================================
    // Plugins
    // =========================================================================

    pub fn use_plugin(&self, plugin: &dyn Plugin) -> Result<(), ViridError> {
        let name = plugin.name();
        if self.inner.plugins.borrow().contains(&name) {
            warn!(plugin = name, "plugin already installed, skipping");
            return Err(ViridError::PluginAlreadyInstalled { name });
        }

        if let Err(source) = plugin.install(self) {
            error!(plugin = name, error = %format!("{source:#}"), "plugin failed to install");
            return Err(ViridError::PluginInstall { name, source });
        }

        self.inner.plugins.borrow_mut().push(name);
        info!(plugin = name, "plugin installed");
        Ok(())
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.inner.plugins.borrow().iter().any(|installed| *installed == name)
    }

    // =========================================================================
    // Components
    // =========================================================================

    /// Bind the component of type `T` and run activation hooks for it.
    ///
    /// Activation hook failures are reported on the error channel; the
    /// component stays bound.
    pub fn bind_component<T: 'static>(&self, value: T) -> Result<Component<T>, ViridError> {
        let (component, hooks) = self.inner.components.borrow_mut().bind(value)?;
        let key = component.key();

        for hook in hooks {
            if let Err(error) = catch_panic(|| hook(key, component.erased())) {
                self.inner.dispatcher.report(Failure {
                    error,
                    context: format!("activation hook failed for {key}"),
                });
            }
        }

        debug!(component = %key, "component bound");
        Ok(component)
    }

    pub fn component<T: 'static>(&self) -> Option<Component<T>> {
        self.inner.components.borrow().get::<T>()
    }

    pub(crate) fn erased_component(&self, key: ComponentKey) -> Option<Rc<dyn Any>> {
        self.inner.components.borrow().erased(key)
    }

    /// Run `hook` for every component bound from now on.
    pub fn add_activation_hook(
        &self,
        hook: impl Fn(ComponentKey, Rc<dyn Any>) -> anyhow::Result<()> + 'static,
    ) {
        self.inner
            .components
            .borrow_mut()
            .add_activation_hook(Rc::new(hook));
    }

    // =========================================================================
    // Boundaries
    // =========================================================================

    /// Reach the scheduling boundary: run scheduled tick bodies until idle.
    ///
    /// Returns the number of bodies that ran. A re-entrant chain counts each
    /// of its bodies.
    pub fn flush(&self) -> usize {
        let mut bodies = 0;
        while self.inner.dispatcher.run_scheduled() {
            bodies += 1;
        }
        bodies
    }

    /// Flush, then drive pending asynchronous system results until none are
    /// left, flushing whatever they emit.
    pub async fn settle(&self) -> usize {
        let mut bodies = self.flush();
        loop {
            let pending = self.inner.dispatcher.take_deferred();
            if pending.is_empty() {
                return bodies;
            }

            let mut pending: FuturesUnordered<Deferred> = pending.into_iter().collect();
            while let Some(failures) = pending.next().await {
                for failure in failures {
                    self.inner.dispatcher.report(failure);
                }
                bodies += self.flush();
            }
        }
    }

    pub fn global_tick(&self) -> u64 {
        self.inner.dispatcher.global_tick()
    }

    pub fn state(&self) -> TickState {
        self.inner.dispatcher.state()
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("dispatcher", &self.inner.dispatcher)
            .field("components", &self.inner.components.borrow())
            .field("plugins", &self.inner.plugins.borrow())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`App`].
pub struct AppBuilder {
    default_systems: bool,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            default_systems: true,
        }
    }

    /// Skip the built-in atomic-modify executor and report loggers.
    ///
    /// Without a system for `ErrorMessage`, failures are only logged.
    pub fn without_default_systems(mut self) -> Self {
        self.default_systems = false;
        self
    }

    pub fn build(self) -> App {
        let app = App {
            inner: Rc::new(AppInner {
                dispatcher: Dispatcher::new(),
                components: RefCell::new(Components::default()),
                plugins: RefCell::new(Vec::new()),
            }),
        };

        if self.default_systems {
            install_global_systems(&app);
        }
        app
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn install_global_systems(app: &App) {
    let inner = Rc::downgrade(&app.inner);
    let globals = [
        (
            System::ordered::<AtomicModify>(move |modify| apply_modify(&inner, modify))
                .named("virid", "atomic_modify"),
            ATOMIC_MODIFY_PRIORITY,
        ),
        (
            System::ordered::<ErrorMessage>(|report| {
                error!(context = %report.context, error = %format!("{:#}", report.error), "error reported");
                Ok(())
            })
            .named("virid", "log_error"),
            REPORT_LOG_PRIORITY,
        ),
        (
            System::ordered::<WarnMessage>(|report| {
                warn!(context = %report.context, "warning reported");
                Ok(())
            })
            .named("virid", "log_warning"),
            REPORT_LOG_PRIORITY,
        ),
    ];

    for (system, priority) in globals {
        // fresh app, fresh systems: registration cannot collide
        if let Err(e) = app.inner.dispatcher.register(system, priority) {
            error!(error = %e, "failed to install global system");
        }
    }
}

fn apply_modify(app: &Weak<AppInner>, modify: &AtomicModify) -> anyhow::Result<()> {
    let inner = app.upgrade().ok_or(ViridError::AppDropped)?;
    let target = modify.target();
    let slot = inner
        .components
        .borrow()
        .slot(target)
        .ok_or(ViridError::ComponentNotBound {
            component: target.name(),
        })?;

    slot.modify(&|component: &mut dyn Any| modify.apply_to(component))
        .with_context(|| format!("modify failed: {}", modify.label()))?;

    debug!(component = %target, label = modify.label(), "atomic modify applied");
    Ok(())
}

// =============================================================================
// Writer
// =============================================================================

/// Weak handle for emitting messages from inside systems and hooks.
///
/// Holding a `Writer` does not keep the app alive.
#[derive(Clone)]
pub struct Writer {
    app: Weak<AppInner>,
}

impl Writer {
    pub fn send<M: Message>(&self, message: M) -> Result<(), ViridError> {
        self.dispatcher_call(|d| d.dispatch(Envelope::new(message)))
    }

    /// Report an error on the error channel.
    pub fn error(
        &self,
        error: impl Into<anyhow::Error>,
        context: impl Into<String>,
    ) -> Result<(), ViridError> {
        self.send(ErrorMessage::new(error, context))
    }

    pub fn warn(&self, context: impl Into<String>) -> Result<(), ViridError> {
        self.send(WarnMessage::new(context))
    }

    /// Request a mutation of component `T` through the atomic-modify channel.
    pub fn modify<T: 'static>(
        &self,
        recipe: impl Fn(&mut T) + 'static,
        label: impl Into<String>,
    ) -> Result<(), ViridError> {
        self.send(AtomicModify::new::<T>(recipe, label))
    }

    pub fn upgrade(&self) -> Option<App> {
        self.app.upgrade().map(|inner| App { inner })
    }

    fn dispatcher_call<R>(
        &self,
        f: impl FnOnce(&Dispatcher) -> Result<R, ViridError>,
    ) -> Result<R, ViridError> {
        let inner = self.app.upgrade().ok_or(ViridError::AppDropped)?;
        f(&inner.dispatcher)
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("alive", &(self.app.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// Unregister
// =============================================================================

/// Removes a registered system. Dropping it leaves the system registered.
pub struct Unregister {
    action: Option<Box<dyn FnOnce() -> bool>>,
}

impl Unregister {
    /// Remove the system. Returns whether it was still registered.
    pub fn unregister(mut self) -> bool {
        self.action.take().map(|action| action()).unwrap_or(false)
    }
}

impl std::fmt::Debug for Unregister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unregister").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ReportLog;
    use std::cell::Cell;

    #[derive(Debug, Default, PartialEq)]
    struct Counter {
        count: i32,
    }

    #[derive(Debug)]
    struct Bump(i32);
    crate::ordered_message!(Bump);

    struct Scrolled;
    crate::coalesced_message!(Scrolled);

    fn bump_system(counter: &Component<Counter>) -> System {
        let counter = counter.clone();
        System::ordered::<Bump>(move |bump| {
            counter.update(|c| c.count += bump.0);
            Ok(())
        })
        .with_param::<Counter>()
    }

    #[test]
    fn dispatch_then_flush_runs_system() {
        let app = App::new();
        let counter = app.bind_component(Counter::default()).unwrap();
        app.register(bump_system(&counter), 0).unwrap();

        app.dispatch(Bump(5)).unwrap();
        assert_eq!(counter.borrow().count, 0);

        assert_eq!(app.flush(), 1);
        assert_eq!(counter.borrow().count, 5);
        assert_eq!(app.global_tick(), 1);
        assert_eq!(app.state(), TickState::Idle);
    }

    #[test]
    fn unregister_stops_delivery() {
        let app = App::new();
        let counter = app.bind_component(Counter::default()).unwrap();
        let handle = app.register(bump_system(&counter), 0).unwrap();

        assert!(handle.unregister());

        let result = app.dispatch(Bump(1));
        assert!(matches!(result, Err(ViridError::NoSystemRegistered { .. })));
        assert_eq!(app.flush(), 0);
    }

    #[test]
    fn atomic_modify_mutates_bound_component() {
        let app = App::new();
        let counter = app.bind_component(Counter::default()).unwrap();

        app.writer()
            .modify::<Counter>(|c| c.count = 99, "set to 99")
            .unwrap();
        app.flush();

        assert_eq!(counter.borrow().count, 99);
    }

    #[test]
    fn atomic_modify_on_unbound_component_is_reported() {
        let app = App::new();
        let reports = ReportLog::attach(&app).unwrap();

        app.writer().modify::<Counter>(|c| c.count = 1, "ghost").unwrap();
        app.flush();

        assert_eq!(reports.errors().len(), 1);
        assert!(reports.errors()[0].contains("not bound"));
    }

    #[test]
    fn systems_reacting_to_modify_run_after_executor() {
        let app = App::new();
        let counter = app.bind_component(Counter::default()).unwrap();
        let observed = Rc::new(Cell::new(-1));
        let probe = observed.clone();
        let watched = counter.clone();
        app.register(
            System::ordered::<AtomicModify>(move |_| {
                probe.set(watched.borrow().count);
                Ok(())
            }),
            0,
        )
        .unwrap();

        app.writer().modify::<Counter>(|c| c.count = 7, "seven").unwrap();
        app.flush();

        assert_eq!(observed.get(), 7);
    }

    #[test]
    fn writer_fails_once_app_is_dropped() {
        let app = App::new();
        let writer = app.writer();
        drop(app);

        assert!(matches!(writer.warn("late"), Err(ViridError::AppDropped)));
        assert!(writer.upgrade().is_none());
    }

    #[test]
    fn activation_hooks_run_on_bind() {
        let app = App::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        app.add_activation_hook(move |key, erased| {
            assert!(erased.downcast_ref::<RefCell<Counter>>().is_some());
            sink.borrow_mut().push(key);
            Ok(())
        });

        app.bind_component(Counter::default()).unwrap();

        assert_eq!(*seen.borrow(), vec![ComponentKey::of::<Counter>()]);
        assert!(app.component::<Counter>().is_some());
    }

    #[test]
    fn failing_activation_hook_is_reported() {
        let app = App::new();
        let reports = ReportLog::attach(&app).unwrap();
        app.add_activation_hook(|_, _| anyhow::bail!("cannot track"));

        let bound = app.bind_component(Counter::default());
        app.flush();

        assert!(bound.is_ok());
        assert!(reports.errors()[0].contains("cannot track"));
    }

    struct Greeter;

    impl Plugin for Greeter {
        fn name(&self) -> &'static str {
            "greeter"
        }

        fn install(&self, app: &App) -> anyhow::Result<()> {
            app.register(System::coalesced::<Scrolled>(|_| Ok(())), 0)?;
            Ok(())
        }
    }

    #[test]
    fn plugin_installs_once() {
        let app = App::new();

        app.use_plugin(&Greeter).unwrap();
        let again = app.use_plugin(&Greeter);

        assert!(app.has_plugin("greeter"));
        assert!(matches!(
            again,
            Err(ViridError::PluginAlreadyInstalled { name: "greeter" })
        ));
    }

    #[test]
    fn middleware_sees_messages_before_the_hub() {
        let app = App::new();
        let counter = app.bind_component(Counter::default()).unwrap();
        app.register(bump_system(&counter), 0).unwrap();
        let seen = Rc::new(Cell::new(0));
        let probe = seen.clone();
        app.use_middleware(
            move |envelope, next| {
                if envelope.is::<Bump>() {
                    probe.set(probe.get() + 1);
                }
                next.run();
            },
            false,
        );

        app.dispatch(Bump(2)).unwrap();
        app.dispatch(Bump(3)).unwrap();
        app.flush();

        assert_eq!(seen.get(), 2);
        assert_eq!(counter.borrow().count, 5);
    }

    #[test]
    fn tick_hooks_share_chain_payload() {
        let app = App::new();
        let counter = app.bind_component(Counter::default()).unwrap();
        app.register(bump_system(&counter), 0).unwrap();
        let carried = Rc::new(RefCell::new(None));
        app.on_before_tick(
            |ctx| {
                ctx.payload.insert("opened".into(), serde_json::json!(true));
                Ok(())
            },
            false,
        );
        let sink = carried.clone();
        app.on_after_tick(
            move |ctx| {
                *sink.borrow_mut() = ctx.payload.get("opened").cloned();
                Ok(())
            },
            false,
        );

        app.dispatch(Bump(1)).unwrap();
        app.flush();

        assert_eq!(*carried.borrow(), Some(serde_json::json!(true)));
    }

    #[tokio::test]
    async fn settle_runs_after_hooks_when_async_system_finishes() {
        let app = App::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let sink = order.clone();
        app.register(
            System::ordered_async::<Bump, _, _>(move |bump| {
                let sink = sink.clone();
                let n = bump.0;
                async move {
                    tokio::task::yield_now().await;
                    sink.borrow_mut().push(format!("system:{n}"));
                    Ok(())
                }
            }),
            0,
        )
        .unwrap();
        let sink = order.clone();
        app.on_after_execute(
            MessageFilter::of::<Bump>(),
            move |_, _| {
                sink.borrow_mut().push("after".to_string());
                Ok(())
            },
            false,
        );

        app.dispatch(Bump(4)).unwrap();
        app.flush();
        assert!(order.borrow().is_empty(), "tick ended before the future settled");

        app.settle().await;

        assert_eq!(*order.borrow(), vec!["system:4", "after"]);
    }

    #[tokio::test]
    async fn async_failure_is_reported_on_settle() {
        let app = App::new();
        let reports = ReportLog::attach(&app).unwrap();
        app.register(
            System::ordered_async::<Bump, _, _>(|_| async {
                Err::<(), _>(anyhow::anyhow!("late failure"))
            })
                .named("Remote", "on_bump"),
            0,
        )
        .unwrap();

        app.dispatch(Bump(1)).unwrap();
        app.settle().await;

        let errors = reports.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("async error in Remote::on_bump"));
        assert!(errors[0].contains("late failure"));
    }
}
