//! Testing utilities for virid apps.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! virid = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Capturing the Error Channel
//!
//! ```ignore
//! use virid::testing::ReportLog;
//!
//! let app = App::new();
//! let reports = ReportLog::attach(&app)?;
//!
//! app.dispatch(Broken)?;
//! app.flush();
//!
//! assert!(reports.contains_error("Broken::on_message"));
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::app::App;
use crate::error::ViridError;
use crate::message::{ErrorMessage, WarnMessage};
use crate::system::System;

/// Priority of the recorders; runs after every other report consumer.
pub const REPORT_RECORDER_PRIORITY: i32 = -1000;

/// Records everything that travels on the error and warn channels.
///
/// Errors are stored as `"{context}: {error:#}"`, warnings as their context.
#[derive(Clone, Default)]
pub struct ReportLog {
    errors: Rc<RefCell<Vec<String>>>,
    warnings: Rc<RefCell<Vec<String>>>,
}

impl ReportLog {
    /// Register recorder systems for both channels on `app`.
    pub fn attach(app: &App) -> Result<Self, ViridError> {
        let log = Self::default();

        let errors = log.errors.clone();
        app.register(
            System::ordered::<ErrorMessage>(move |report| {
                errors
                    .borrow_mut()
                    .push(format!("{}: {:#}", report.context, report.error));
                Ok(())
            })
            .named("ReportLog", "record_error"),
            REPORT_RECORDER_PRIORITY,
        )?;

        let warnings = log.warnings.clone();
        app.register(
            System::ordered::<WarnMessage>(move |report| {
                warnings.borrow_mut().push(report.context.clone());
                Ok(())
            })
            .named("ReportLog", "record_warning"),
            REPORT_RECORDER_PRIORITY,
        )?;

        Ok(log)
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.borrow().clone()
    }

    /// Whether any recorded error contains `needle`.
    pub fn contains_error(&self, needle: &str) -> bool {
        self.errors.borrow().iter().any(|e| e.contains(needle))
    }

    pub fn clear(&self) {
        self.errors.borrow_mut().clear();
        self.warnings.borrow_mut().clear();
    }
}

impl std::fmt::Debug for ReportLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportLog")
            .field("errors", &self.errors.borrow())
            .field("warnings", &self.warnings.borrow())
            .finish()
    }
}
