//! Structured event reporting.
//!
//! Components never initialize global logging. They receive an
//! [`EventSink`] and report through it; binaries hand in a [`TracingSink`]
//! after installing a subscriber, tests use a [`MemorySink`].

use std::sync::Mutex;

/// Severity of a reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// A single recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub level: Level,
    pub message: String,
}

/// Receiver for info/warn/error events.
pub trait EventSink: Send + Sync {
    fn emit(&self, level: Level, message: &str);

    fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.emit(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.emit(Level::Error, message);
    }
}

/// Forwards events to the `tracing` macros under the `charnn` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!(target: "charnn", "{message}"),
            Level::Warn => tracing::warn!(target: "charnn", "{message}"),
            Level::Error => tracing::error!(target: "charnn", "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _level: Level, _message: &str) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Recorded events at exactly `level`.
    #[must_use]
    pub fn at_level(&self, level: Level) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, level: Level, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Event {
                level,
                message: message.to_string(),
            });
    }
}
