//! In-memory queue of accepted records awaiting export
//!
//! Request handlers append, the export task drains from the front. A drain
//! may take only a prefix when the current export page cannot hold the whole
//! queue; the rest waits for the next cycle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use crate::lock_utils::lock_or_recover;

/// Maximum message length in characters
pub const MAX_MESSAGE_LENGTH: usize = 8192;

/// Severity of a client log record (wire values 0..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl LogLevel {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warning),
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Critical),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current local time in the record timestamp format
pub fn timestamp_now() -> String {
    chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// One accepted client log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub timestamp: String,
    pub message: String,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    ///
    /// Callers validate the message length first; see `handlers`.
    pub fn new(level: LogLevel, message: String) -> Self {
        Self {
            level,
            timestamp: timestamp_now(),
            message,
        }
    }
}

/// FIFO of records pending export
#[derive(Debug, Default)]
pub struct LogBuffer {
    records: Mutex<VecDeque<LogRecord>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: LogRecord) {
        lock_or_recover(&self.records, "log buffer").push_back(record);
    }

    /// Append a whole batch under one lock so it stays contiguous.
    pub fn extend(&self, records: impl IntoIterator<Item = LogRecord>) {
        lock_or_recover(&self.records, "log buffer").extend(records);
    }

    /// Remove and return up to `max` records from the front.
    pub fn drain_front(&self, max: usize) -> Vec<LogRecord> {
        let mut records = lock_or_recover(&self.records, "log buffer");
        let count = max.min(records.len());
        records.drain(..count).collect()
    }

    /// Put records taken by `drain_front` back at the front, order preserved.
    pub fn restore_front(&self, drained: Vec<LogRecord>) {
        let mut records = lock_or_recover(&self.records, "log buffer");
        for record in drained.into_iter().rev() {
            records.push_front(record);
        }
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.records, "log buffer").len()
    }

    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.records, "log buffer").is_empty()
    }

    /// Copy of the pending records, front first
    pub fn snapshot(&self) -> Vec<LogRecord> {
        lock_or_recover(&self.records, "log buffer")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn record(message: &str) -> LogRecord {
        LogRecord::new(LogLevel::Info, message.to_string())
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::from_i64(0), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_i64(4), Some(LogLevel::Critical));
        assert_eq!(LogLevel::from_i64(5), None);
        assert_eq!(LogLevel::from_i64(-1), None);
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warning.to_string(), "WARNING");
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp_now();
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, "%Y-%m-%d %H:%M:%S%.6f").is_ok());
    }

    #[test]
    fn test_partial_drain_keeps_remainder_in_order() {
        let buffer = LogBuffer::new();
        for i in 0..10 {
            buffer.push(record(&format!("m{}", i)));
        }

        let drained = buffer.drain_front(3);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].message, "m0");
        assert_eq!(drained[2].message, "m2");
        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer.snapshot()[0].message, "m3");
    }

    #[test]
    fn test_drain_more_than_available() {
        let buffer = LogBuffer::new();
        buffer.extend(vec![record("a"), record("b")]);

        let drained = buffer.drain_front(100);
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_restore_front() {
        let buffer = LogBuffer::new();
        buffer.extend((0..5).map(|i| record(&format!("m{}", i))));

        let drained = buffer.drain_front(2);
        buffer.push(record("late"));
        buffer.restore_front(drained);

        let messages: Vec<String> = buffer.snapshot().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["m0", "m1", "m2", "m3", "m4", "late"]);
    }

    #[test]
    fn test_concurrent_push() {
        let buffer = Arc::new(LogBuffer::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..100 {
                        buffer.push(record(&format!("{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.len(), 800);
    }
}
