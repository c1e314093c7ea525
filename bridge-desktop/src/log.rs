//! Console Log Sink

use bridge_traits::log::{LogEntry, LogLevel, LogSink};

/// Writes log entries to stderr, one line per entry.
///
/// Useful for terminal front-ends that keep stdout for progress output.
#[derive(Debug, Clone)]
pub struct ConsoleLogSink {
    pub min_level: LogLevel,
}

impl Default for ConsoleLogSink {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
        }
    }
}

impl ConsoleLogSink {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }

    fn format(entry: &LogEntry) -> String {
        let mut line = format!(
            "[{}] {:<5} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.level.as_str().to_uppercase(),
            entry.target,
            entry.message
        );

        if !entry.fields.is_empty() {
            let mut fields: Vec<_> = entry.fields.iter().collect();
            fields.sort();
            for (key, value) in fields {
                line.push_str(&format!(" {}={}", key, value));
            }
        }

        line
    }
}

impl LogSink for ConsoleLogSink {
    fn log(&self, entry: LogEntry) {
        if entry.level >= self.min_level {
            eprintln!("{}", Self::format(&entry));
        }
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }
}
