//! Progress reporting and cooperative cancellation.
//!
//! Import code reports through a single observer interface. A call carries an
//! optional section label and an optional message; a call with neither is a
//! heartbeat. Every reporter call is also a yield point: the cancellation
//! token is checked there and nowhere else, so a job inside a blocking
//! external call runs until that call returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SyncError};

/// Single-method observer for import progress
pub trait Progress: Send + Sync {
    fn on_progress(&self, section: Option<&str>, message: Option<&str>);
}

/// Observer that discards everything
pub struct NullProgress;

impl Progress for NullProgress {
    fn on_progress(&self, _section: Option<&str>, _message: Option<&str>) {}
}

/// Observer that writes status lines to the log
#[derive(Default)]
pub struct LogProgress {
    fmt: SectionFormatter,
}

impl Progress for LogProgress {
    fn on_progress(&self, section: Option<&str>, message: Option<&str>) {
        if let Some(line) = self.fmt.format(section, message) {
            log::info!("{line}");
        }
    }
}

/// Renders observer calls into status-protocol lines, remembering the last
/// section so bare messages can be prefixed with it.
#[derive(Default)]
pub struct SectionFormatter {
    last_section: Mutex<String>,
}

impl SectionFormatter {
    /// Returns the line to emit, or None for a pure heartbeat
    pub fn format(&self, section: Option<&str>, message: Option<&str>) -> Option<String> {
        let mut last = self.last_section.lock().unwrap();
        if let Some(section) = section {
            *last = section.to_string();
        }
        match (section, message) {
            (_, Some(message)) => Some(format!("{}: {}", last, message)),
            (Some(section), None) => Some(section.to_string()),
            (None, None) => None,
        }
    }

    pub fn reset(&self) {
        self.last_section.lock().unwrap().clear();
    }
}

/// Cooperative cancellation flag shared across threads
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Bundles the observer with the cancellation token; every call checks the
/// token after delivering the event.
pub struct Reporter<'a> {
    progress: &'a dyn Progress,
    cancel: &'a CancelToken,
}

impl<'a> Reporter<'a> {
    pub fn new(progress: &'a dyn Progress, cancel: &'a CancelToken) -> Self {
        Reporter { progress, cancel }
    }

    /// Start a new section
    pub fn section(&self, section: &str) -> Result<()> {
        self.progress.on_progress(Some(section), None);
        self.cancel.check()
    }

    /// Message within the current section
    pub fn message(&self, message: &str) -> Result<()> {
        self.progress.on_progress(None, Some(message));
        self.cancel.check()
    }

    /// Start a section with an initial message
    pub fn section_message(&self, section: &str, message: &str) -> Result<()> {
        self.progress.on_progress(Some(section), Some(message));
        self.cancel.check()
    }

    /// Heartbeat: no new text, just a yield point
    pub fn tick(&self) -> Result<()> {
        self.progress.on_progress(None, None);
        self.cancel.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test observer capturing formatted lines
    #[derive(Default)]
    pub struct CaptureProgress {
        fmt: SectionFormatter,
        pub lines: Mutex<Vec<String>>,
    }

    impl Progress for CaptureProgress {
        fn on_progress(&self, section: Option<&str>, message: Option<&str>) {
            if let Some(line) = self.fmt.format(section, message) {
                self.lines.lock().unwrap().push(line);
            }
        }
    }

    #[test]
    fn formatter_prefixes_messages_with_last_section() {
        let fmt = SectionFormatter::default();
        assert_eq!(fmt.format(Some("Counting"), None).as_deref(), Some("Counting"));
        assert_eq!(
            fmt.format(None, Some("found 3")).as_deref(),
            Some("Counting: found 3")
        );
        assert_eq!(
            fmt.format(Some("Importing"), Some("batch 1")).as_deref(),
            Some("Importing: batch 1")
        );
        assert_eq!(fmt.format(None, None), None);
    }

    #[test]
    fn heartbeat_produces_no_line() {
        let capture = CaptureProgress::default();
        let cancel = CancelToken::new();
        let rep = Reporter::new(&capture, &cancel);
        rep.section("Working").unwrap();
        rep.tick().unwrap();
        rep.message("step").unwrap();
        assert_eq!(
            *capture.lines.lock().unwrap(),
            vec!["Working".to_string(), "Working: step".to_string()]
        );
    }

    #[test]
    fn cancelled_token_fails_at_yield_points() {
        let cancel = CancelToken::new();
        let rep = Reporter::new(&NullProgress, &cancel);
        rep.tick().unwrap();
        cancel.cancel();
        assert!(matches!(rep.tick(), Err(SyncError::Cancelled)));
        assert!(matches!(rep.section("x"), Err(SyncError::Cancelled)));
    }
}
