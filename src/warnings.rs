use std::fmt;

use log::warn;
use parking_lot::Mutex;

use crate::gpio::Channel;

/// Non-fatal conditions reported while warnings are enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    AlreadyInUse(Channel),
    CleanupOfNothing,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::AlreadyInUse(channel) => write!(
                f,
                "Channel {channel} is already in use, continuing anyway. Use set_warnings(false) to disable warnings."
            ),
            Warning::CleanupOfNothing => write!(
                f,
                "No channels have been set up yet - nothing to clean up! Use set_warnings(false) to disable warnings."
            ),
        }
    }
}

/// Receives warnings and swallowed callback failures.
pub trait WarningSink: Send + Sync {
    fn warn(&self, warning: &Warning) {
        warn!("{warning}");
    }

    fn callback_failed(&self, channel: Channel, error: &str) {
        warn!("event callback for channel {channel} failed: {error}");
    }
}

#[derive(Debug, Default)]
pub struct LogSink;

impl WarningSink for LogSink {}

/// Keeps everything it receives; handy for asserting on warnings.
#[derive(Debug, Default)]
pub struct RecordingSink {
    warnings: Mutex<Vec<Warning>>,
    callback_failures: Mutex<Vec<(Channel, String)>>,
}

impl RecordingSink {
    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings.lock().clone()
    }

    pub fn callback_failures(&self) -> Vec<(Channel, String)> {
        self.callback_failures.lock().clone()
    }

    pub fn clear(&self) {
        self.warnings.lock().clear();
        self.callback_failures.lock().clear();
    }
}

impl WarningSink for RecordingSink {
    fn warn(&self, warning: &Warning) {
        self.warnings.lock().push(warning.clone());
    }

    fn callback_failed(&self, channel: Channel, error: &str) {
        self.callback_failures
            .lock()
            .push((channel, error.to_string()));
    }
}
