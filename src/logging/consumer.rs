// SPDX-License-Identifier: Apache-2.0 OR MIT
// Log consumer task: drains the registry channel into a sink.

use std::time::UNIX_EPOCH;

use tokio::sync::mpsc;

use super::logger::LogEntry;

/// Destination for formatted log lines.
pub trait LogSink: Send {
    fn write_line(&mut self, line: &str);
}

/// Default sink: one line per entry on stderr.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&mut self, line: &str) {
        eprintln!("{}", line);
    }
}

/// Drains log entries and writes them to a sink until all loggers are gone.
pub struct LogConsumer {
    rx: mpsc::UnboundedReceiver<LogEntry>,
}

impl LogConsumer {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<LogEntry>) -> Self {
        Self { rx }
    }

    #[cfg(test)]
    pub(crate) async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Run until the channel closes (every Logger and the registry dropped).
    pub async fn run(mut self, mut sink: impl LogSink) {
        while let Some(entry) = self.rx.recv().await {
            sink.write_line(&format_entry(&entry));
        }
    }
}

fn format_entry(entry: &LogEntry) -> String {
    let since_epoch = entry
        .timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03} {:<9} {:<12} {}",
        since_epoch.as_secs(),
        since_epoch.subsec_millis(),
        entry.severity.as_str(),
        entry.facility.as_str(),
        entry.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Facility, LogRegistry, Severity};

    struct VecSink(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

    impl LogSink for VecSink {
        fn write_line(&mut self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn test_consumer_formats_lines() {
        let (registry, consumer) = LogRegistry::new(Severity::Debug);
        let logger = registry.logger();
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = VecSink(lines.clone());

        logger.notice(Facility::Kernel, "vif 3 registered");
        drop(registry);
        drop(logger);
        consumer.run(sink).await;

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("NOTICE"));
        assert!(lines[0].contains("Kernel"));
        assert!(lines[0].contains("vif 3 registered"));
    }
}
