//! Structured error types for virid.
//!
//! `ViridError` covers configuration and scheduler errors: things the caller
//! did at a call site (registering a system twice, dispatching a message
//! nobody listens to) plus the fatal deadlock report. `HistoryError` covers the
//! version store.
//!
//! # The Error Channel Rule
//!
//! > **Errors raised inside a tick never unwind out of the tick.**
//!
//! - Call-site errors are returned as `Result` values
//! - Handler and hook failures are caught at the task boundary and travel as
//!   [`ErrorMessage`](crate::ErrorMessage) on the error channel
//! - Entity history boundaries (seek, undo or redo past the window) are plain
//!   `bool`s; tick travel out of the window is a `HistoryError`
//!
//! # Example
//!
//! ```ignore
//! use virid::{App, ViridError};
//!
//! match app.dispatch(Clicked { x: 1, y: 2 }) {
//!     Ok(()) => {}
//!     Err(ViridError::NoSystemRegistered { message }) => {
//!         eprintln!("nobody handles {message}");
//!     }
//!     Err(e) => eprintln!("dispatch failed: {e}"),
//! }
//! ```

use thiserror::Error;

use crate::message::Discipline;

/// Configuration and scheduler errors.
#[derive(Debug, Error)]
pub enum ViridError {
    /// The same system was registered twice for one message type.
    #[error("system {system} is already registered for {message}")]
    SystemAlreadyRegistered {
        message: &'static str,
        system: String,
    },

    /// A message was dispatched but no system listens to its type.
    #[error("no system registered for {message}")]
    NoSystemRegistered { message: &'static str },

    /// A system built for one discipline was registered for a message of the other.
    #[error("system {system} expects {expected:?} messages but {message} is {actual:?}")]
    DisciplineMismatch {
        system: String,
        message: &'static str,
        expected: Discipline,
        actual: Discipline,
    },

    /// A payload did not contain the message type the system was built for.
    #[error("type mismatch: expected {expected}, received {found}")]
    MessageTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("component {component} is already bound")]
    ComponentAlreadyBound { component: &'static str },

    #[error("component {component} is not bound")]
    ComponentNotBound { component: &'static str },

    #[error("component {component} is borrowed elsewhere")]
    ComponentBusy { component: &'static str },

    #[error("plugin {name} is already installed")]
    PluginAlreadyInstalled { name: &'static str },

    #[error("plugin {name} failed to install")]
    PluginInstall {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The app behind a [`Writer`](crate::Writer) has been dropped.
    #[error("app has been dropped")]
    AppDropped,

    /// Re-entrant ticking exceeded the depth bound. Pending messages were discarded.
    #[error("deadlock: re-entrant tick depth exceeded {limit}, pending messages were discarded")]
    Deadlock { limit: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Version store errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The component was never activated under the version store.
    #[error("component {component} has no version history")]
    NotInitialized { component: &'static str },

    #[error("failed to serialize {component}")]
    Serialize {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to restore {component}")]
    Deserialize {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to diff {component}")]
    Diff {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A version store operation was re-entered while another was running.
    #[error("version store is busy ({operation})")]
    Busy { operation: &'static str },

    #[error("tick {tick} is outside the reachable window [{min}, {max}]")]
    TickOutOfRange { tick: u64, min: u64, max: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_message_names_the_limit() {
        let err = ViridError::Deadlock { limit: 100 };
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn history_errors_keep_their_source() {
        let err = HistoryError::Serialize {
            component: "Counter",
            source: anyhow::anyhow!("boom"),
        };

        let source = std::error::Error::source(&err).map(|s| s.to_string());

        assert_eq!(source.as_deref(), Some("boom"));
        assert!(err.to_string().contains("Counter"));
    }

    #[test]
    fn tick_out_of_range_reports_window() {
        let err = HistoryError::TickOutOfRange {
            tick: 9,
            min: 2,
            max: 4,
        };
        assert_eq!(
            err.to_string(),
            "tick 9 is outside the reachable window [2, 4]"
        );
    }
}
