// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handles and the process-wide log registry.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;

use super::consumer::LogConsumer;
use super::{Facility, Severity};

/// A single formatted log record in flight to the consumer.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub severity: Severity,
    pub facility: Facility,
    pub timestamp: SystemTime,
    pub message: String,
}

/// Process-wide registry: owns the severity threshold and hands out loggers.
pub struct LogRegistry {
    tx: mpsc::UnboundedSender<LogEntry>,
    min_severity: Arc<AtomicU8>,
}

impl LogRegistry {
    /// Create a registry and the consumer that drains it.
    ///
    /// The consumer must be spawned by the caller; dropping it silently
    /// discards all log output, which is what unit tests want.
    pub fn new(min_severity: Severity) -> (Self, LogConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            tx,
            min_severity: Arc::new(AtomicU8::new(min_severity.as_u8())),
        };
        (registry, LogConsumer::new(rx))
    }

    /// Hand out a logger handle. Handles are cheap to clone and share the
    /// registry's severity threshold.
    pub fn logger(&self) -> Logger {
        Logger {
            tx: self.tx.clone(),
            min_severity: Arc::clone(&self.min_severity),
        }
    }

    /// Change the threshold at runtime (e.g. from a verbosity flag).
    pub fn set_min_severity(&self, severity: Severity) {
        self.min_severity.store(severity.as_u8(), Ordering::Relaxed);
    }
}

/// Cloneable logging handle carried by every component.
#[derive(Clone)]
pub struct Logger {
    tx: mpsc::UnboundedSender<LogEntry>,
    min_severity: Arc<AtomicU8>,
}

impl Logger {
    /// A logger whose output goes nowhere. For tests and default values.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            tx,
            min_severity: Arc::new(AtomicU8::new(Severity::Debug.as_u8())),
        }
    }

    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if severity.as_u8() > self.min_severity.load(Ordering::Relaxed) {
            return;
        }
        // Receiver gone means the process is shutting down; drop the entry.
        let _ = self.tx.send(LogEntry {
            severity,
            facility,
            timestamp: SystemTime::now(),
            message: message.to_string(),
        });
    }

    pub fn emergency(&self, facility: Facility, message: &str) {
        self.log(Severity::Emergency, facility, message);
    }

    pub fn alert(&self, facility: Facility, message: &str) {
        self.log(Severity::Alert, facility, message);
    }

    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("min_severity", &self.min_severity.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_threshold_filters_entries() {
        let (registry, mut consumer) = LogRegistry::new(Severity::Warning);
        let logger = registry.logger();

        logger.debug(Facility::Test, "filtered out");
        logger.error(Facility::Test, "kept");
        drop(registry);
        drop(logger);

        let mut kept = Vec::new();
        while let Some(entry) = consumer.recv().await {
            kept.push(entry);
        }
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].severity, Severity::Error);
        assert_eq!(kept[0].message, "kept");
    }

    #[test]
    fn test_discard_logger_never_panics() {
        let logger = Logger::discard();
        logger.info(Facility::Test, "goes nowhere");
    }
}
