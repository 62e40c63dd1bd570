//! Host logger interface and the guest-facing virtual console.
//!
//! Everything in the gateway logs through the [`Logger`] trait. Production uses
//! [`TracingLogger`]; [`MemoryLogger`] keeps entries in memory so callers (and
//! tests) can inspect what a render produced.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Silly,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Silly => "silly",
        };
        f.write_str(name)
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, meta: Option<&Value>);

    fn error(&self, message: &str, meta: Option<&Value>) {
        self.log(LogLevel::Error, message, meta);
    }

    fn warn(&self, message: &str, meta: Option<&Value>) {
        self.log(LogLevel::Warn, message, meta);
    }

    fn info(&self, message: &str, meta: Option<&Value>) {
        self.log(LogLevel::Info, message, meta);
    }

    fn debug(&self, message: &str, meta: Option<&Value>) {
        self.log(LogLevel::Debug, message, meta);
    }

    fn silly(&self, message: &str, meta: Option<&Value>) {
        self.log(LogLevel::Silly, message, meta);
    }
}

/// Forwards to the `tracing` macros; `silly` becomes `trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, meta: Option<&Value>) {
        match (level, meta) {
            (LogLevel::Error, Some(meta)) => tracing::error!(%meta, "{}", message),
            (LogLevel::Error, None) => tracing::error!("{}", message),
            (LogLevel::Warn, Some(meta)) => tracing::warn!(%meta, "{}", message),
            (LogLevel::Warn, None) => tracing::warn!("{}", message),
            (LogLevel::Info, Some(meta)) => tracing::info!(%meta, "{}", message),
            (LogLevel::Info, None) => tracing::info!("{}", message),
            (LogLevel::Debug, Some(meta)) => tracing::debug!(%meta, "{}", message),
            (LogLevel::Debug, None) => tracing::debug!("{}", message),
            (LogLevel::Silly, Some(meta)) => tracing::trace!(%meta, "{}", message),
            (LogLevel::Silly, None) => tracing::trace!("{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub meta: Option<Value>,
}

/// Captures log entries instead of printing them.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Entries at `level` whose message contains `needle`.
    pub fn matching(&self, level: LogLevel, needle: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == level && entry.message.contains(needle))
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, message: &str, meta: Option<&Value>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                level,
                message: message.to_string(),
                meta: meta.cloned(),
            });
        }
    }
}

/// DOM error kind raised when a sub-resource (image, script) fails to load.
pub const RESOURCE_LOADING_ERROR: &str = "resource-loading";

/// Routes guest `console.*` calls and DOM errors to the host logger.
#[derive(Clone)]
pub struct VirtualConsole {
    logger: Arc<dyn Logger>,
}

impl VirtualConsole {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }

    /// Map a guest console method name to a host level.
    pub fn level_for(method: &str) -> LogLevel {
        match method {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Silly,
            _ => LogLevel::Info,
        }
    }

    pub fn console(&self, method: &str, message: &str) {
        self.logger.log(Self::level_for(method), message, None);
    }

    /// Report an error raised by the emulated DOM.
    ///
    /// Image loads are never serviced by the resource loader, so their failures
    /// are expected and dropped.
    pub fn dom_error(&self, kind: &str, message: &str) {
        if Self::is_benign(kind, message) {
            return;
        }
        self.logger.error(
            message,
            Some(&serde_json::json!({ "kind": kind, "source": "dom" })),
        );
    }

    fn is_benign(kind: &str, message: &str) -> bool {
        kind == RESOURCE_LOADING_ERROR && message.starts_with("Could not load img")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_levels_map_one_to_one() {
        assert_eq!(VirtualConsole::level_for("log"), LogLevel::Info);
        assert_eq!(VirtualConsole::level_for("info"), LogLevel::Info);
        assert_eq!(VirtualConsole::level_for("warn"), LogLevel::Warn);
        assert_eq!(VirtualConsole::level_for("error"), LogLevel::Error);
        assert_eq!(VirtualConsole::level_for("debug"), LogLevel::Debug);
        assert_eq!(VirtualConsole::level_for("trace"), LogLevel::Silly);
    }

    #[test]
    fn test_console_forwards_to_logger() {
        let logger = MemoryLogger::new();
        let console = VirtualConsole::new(Arc::new(logger.clone()));
        console.console("warn", "careful");
        console.console("log", "hello");

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].message, "careful");
        assert_eq!(entries[1].level, LogLevel::Info);
    }

    #[test]
    fn test_image_load_errors_are_filtered() {
        let logger = MemoryLogger::new();
        let console = VirtualConsole::new(Arc::new(logger.clone()));
        console.dom_error(RESOURCE_LOADING_ERROR, "Could not load img: https://cdn/x.png");
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn test_other_dom_errors_are_logged() {
        let logger = MemoryLogger::new();
        let console = VirtualConsole::new(Arc::new(logger.clone()));
        console.dom_error(RESOURCE_LOADING_ERROR, "Could not load script: https://cdn/x.js");
        console.dom_error("unhandled-exception", "boom");

        let errors = logger.matching(LogLevel::Error, "");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].meta.as_ref().unwrap()["kind"], "unhandled-exception");
    }
}
