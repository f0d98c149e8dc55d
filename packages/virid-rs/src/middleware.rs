//! Middleware - intercept messages before they reach the hub.
//!
//! Each layer receives the envelope and a [`Next`]. Calling `next.run()`
//! passes the message on; returning without calling it swallows the message,
//! which is how bridges redirect message types somewhere else.
//!
//! ```ignore
//! app.use_middleware(|envelope, next| {
//!     if envelope.is::<RemoteCall>() {
//!         bridge.forward(envelope.clone());
//!         return;
//!     }
//!     next.run();
//! }, false);
//! ```

use std::rc::Rc;

use crate::message::Envelope;

pub type MiddlewareFn = dyn Fn(&Envelope, Next<'_>);

/// Continuation handed to a middleware layer.
pub struct Next<'a> {
    rest: &'a [Rc<MiddlewareFn>],
    envelope: &'a Envelope,
    terminal: &'a dyn Fn(&Envelope),
}

impl Next<'_> {
    /// Continue with the next layer, or store the message if this was the last.
    pub fn run(self) {
        match self.rest.split_first() {
            Some((layer, rest)) => layer(
                self.envelope,
                Next {
                    rest,
                    envelope: self.envelope,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(self.envelope),
        }
    }
}

/// Ordered middleware layers.
#[derive(Default, Clone)]
pub(crate) struct Pipeline {
    layers: Vec<Rc<MiddlewareFn>>,
}

impl Pipeline {
    pub fn add(&mut self, layer: Rc<MiddlewareFn>, front: bool) {
        if front {
            self.layers.insert(0, layer);
        } else {
            self.layers.push(layer);
        }
    }

    /// Run `envelope` through every layer, then `terminal`.
    pub fn run(&self, envelope: &Envelope, terminal: &dyn Fn(&Envelope)) {
        Next {
            rest: &self.layers,
            envelope,
            terminal,
        }
        .run();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.layers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Note(&'static str);
    crate::ordered_message!(Note);

    fn recording(tag: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Rc<MiddlewareFn> {
        let log = log.clone();
        Rc::new(move |_: &Envelope, next: Next<'_>| {
            log.borrow_mut().push(tag.to_string());
            next.run();
        })
    }

    #[test]
    fn layers_run_in_order_then_terminal() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.add(recording("second", &log), false);
        pipeline.add(recording("first", &log), true);

        let terminal_log = log.clone();
        pipeline.run(&Envelope::new(Note("hi")), &move |envelope: &Envelope| {
            let note = envelope.downcast_ref::<Note>().map(|n| n.0).unwrap_or("?");
            terminal_log.borrow_mut().push(format!("stored {note}"));
        });

        assert_eq!(*log.borrow(), vec!["first", "second", "stored hi"]);
    }

    #[test]
    fn layer_that_skips_next_swallows_message() {
        let stored = Rc::new(RefCell::new(0));
        let mut pipeline = Pipeline::default();
        pipeline.add(Rc::new(|_: &Envelope, _: Next<'_>| {}), false);

        let counter = stored.clone();
        pipeline.run(&Envelope::new(Note("lost")), &move |_: &Envelope| {
            *counter.borrow_mut() += 1;
        });

        assert_eq!(*stored.borrow(), 0);
    }

    #[test]
    fn empty_pipeline_goes_straight_to_terminal() {
        let stored = Rc::new(RefCell::new(0));
        let pipeline = Pipeline::default();

        let counter = stored.clone();
        pipeline.run(&Envelope::new(Note("direct")), &move |_: &Envelope| {
            *counter.borrow_mut() += 1;
        });

        assert_eq!(*stored.borrow(), 1);
        assert_eq!(pipeline.len(), 0);
    }
}
