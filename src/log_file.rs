//! Append-only log files
//!
//! `LogFile` is the durable sink for a client stream, and also backs the
//! node's own `secure.log` (security audit) and `critical.log` (operational
//! failures). Appends are serialised per file; reads never take the lock and
//! see whatever has been flushed.

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::log_buffer::{timestamp_now, LogLevel, LogRecord};

/// Read block size for tail and line counting
const READ_CHUNK: usize = 64 * 1024;

/// Format one file line
pub fn format_line(level: LogLevel, timestamp: &str, message: &str) -> String {
    format!("[{}] [{}] {}\n", timestamp, level, message)
}

pub struct LogFile {
    path: PathBuf,
    min_level: LogLevel,
    write_lock: Mutex<()>,
}

impl LogFile {
    /// Open (creating if needed) a log file and its parent directories
    pub async fn open(path: impl Into<PathBuf>, min_level: LogLevel) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        Ok(Self {
            path,
            min_level,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Append a line stamped now. Returns `false` when filtered by level.
    pub async fn write(&self, level: LogLevel, message: &str) -> Result<bool> {
        if level < self.min_level {
            return Ok(false);
        }
        self.append(format_line(level, &timestamp_now(), message).as_bytes())
            .await?;
        Ok(true)
    }

    /// Append the records at or above the minimum level in one write.
    /// Returns how many were written.
    pub async fn write_records(&self, records: &[LogRecord]) -> Result<usize> {
        let mut out = String::new();
        let mut written = 0;
        for record in records.iter().filter(|r| r.level >= self.min_level) {
            out.push_str(&format_line(record.level, &record.timestamp, &record.message));
            written += 1;
        }
        if written > 0 {
            self.append(out.as_bytes()).await?;
        }
        Ok(written)
    }

    async fn append(&self, bytes: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Whole file contents
    pub async fn read_all(&self) -> Result<String> {
        let bytes = self.read_bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }

    /// Up to `n` most recent lines, most recent first
    pub async fn tail(&self, n: usize) -> Result<Vec<String>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || tail_lines(&path, n))
            .await
            .context("tail task panicked")?
    }

    /// Number of newline-terminated lines
    pub async fn line_count(&self) -> Result<u64> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut count = 0u64;
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            count += buf[..read].iter().filter(|b| **b == b'\n').count() as u64;
        }
        Ok(count)
    }

    pub async fn byte_size(&self) -> Result<u64> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to stat {}", self.path.display()))?;
        Ok(meta.len())
    }

    /// Truncate the file
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to truncate {}", self.path.display()))?;
        Ok(())
    }
}

/// Read backwards from the end until `n` lines are collected
fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file.seek(SeekFrom::End(0))?;

    let mut pos = len;
    let mut tail: Vec<u8> = Vec::new();
    loop {
        // A trailing newline terminates the last line and doesn't start a new one
        let newlines = tail.iter().filter(|b| **b == b'\n').count();
        let trailing = usize::from(tail.last() == Some(&b'\n'));
        if pos == 0 || newlines >= n + trailing {
            break;
        }

        let step = READ_CHUNK.min(pos as usize);
        pos -= step as u64;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
    }

    let text = String::from_utf8_lossy(&tail);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if pos > 0 && !lines.is_empty() {
        // First line may be cut mid-way
        lines.remove(0);
    }
    let start = lines.len().saturating_sub(n);
    let mut recent: Vec<String> = lines.split_off(start);
    recent.reverse();
    Ok(recent)
}

/// The node's own audit and failure logs
pub struct OperationalLogs {
    secure: LogFile,
    critical: LogFile,
}

impl OperationalLogs {
    pub async fn open(log_dir: &Path) -> Result<Self> {
        Ok(Self {
            secure: LogFile::open(log_dir.join("secure.log"), LogLevel::Debug).await?,
            critical: LogFile::open(log_dir.join("critical.log"), LogLevel::Debug).await?,
        })
    }

    /// Record a security action (e.g. automatic blacklisting)
    pub async fn security(&self, message: &str) {
        warn!(target: "security", "{}", message);
        if let Err(e) = self.secure.write(LogLevel::Warning, message).await {
            error!(target: "critical", "Failed to write security audit entry: {:#}", e);
        }
    }

    /// Record an operational failure that must not stop the node
    pub async fn critical(&self, message: &str) {
        error!(target: "critical", "{}", message);
        if let Err(e) = self.critical.write(LogLevel::Critical, message).await {
            error!(target: "critical", "Failed to write critical log entry: {:#}", e);
        }
    }

    pub fn secure_log(&self) -> &LogFile {
        &self.secure
    }

    pub fn critical_log(&self) -> &LogFile {
        &self.critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp(min_level: LogLevel) -> (tempfile::TempDir, LogFile) {
        let dir = tempfile::tempdir().unwrap();
        let file = LogFile::open(dir.path().join("nested/stream.log"), min_level)
            .await
            .unwrap();
        (dir, file)
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let (_dir, file) = open_temp(LogLevel::Debug).await;
        assert!(file.path().exists());
        assert_eq!(file.byte_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (_dir, file) = open_temp(LogLevel::Debug).await;
        assert!(file.write(LogLevel::Error, "disk almost full").await.unwrap());

        let contents = file.read_all().await.unwrap();
        assert!(contents.contains("[ERROR] disk almost full"));
        assert_eq!(file.line_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_min_level_filter() {
        let (_dir, file) = open_temp(LogLevel::Warning).await;
        assert!(!file.write(LogLevel::Info, "ignored").await.unwrap());

        let records = vec![
            LogRecord::new(LogLevel::Debug, "a".to_string()),
            LogRecord::new(LogLevel::Critical, "b".to_string()),
        ];
        assert_eq!(file.write_records(&records).await.unwrap(), 1);
        assert_eq!(file.line_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_line_format() {
        let (_dir, file) = open_temp(LogLevel::Debug).await;
        let record = LogRecord {
            level: LogLevel::Info,
            timestamp: "2024-01-02 03:04:05.000006".to_string(),
            message: "hello".to_string(),
        };
        file.write_records(&[record]).await.unwrap();
        assert_eq!(
            file.read_all().await.unwrap(),
            "[2024-01-02 03:04:05.000006] [INFO] hello\n"
        );
    }

    #[tokio::test]
    async fn test_tail_most_recent_first() {
        let (_dir, file) = open_temp(LogLevel::Debug).await;
        for i in 0..10 {
            file.write(LogLevel::Info, &format!("line {}", i)).await.unwrap();
        }

        let tail = file.tail(3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("line 9"));
        assert!(tail[2].ends_with("line 7"));

        let all = file.tail(100).await.unwrap();
        assert_eq!(all.len(), 10);
        assert!(all[9].ends_with("line 0"));
    }

    #[tokio::test]
    async fn test_tail_across_chunks() {
        let (_dir, file) = open_temp(LogLevel::Debug).await;
        let long = "x".repeat(8000);
        for i in 0..40 {
            file.write(LogLevel::Info, &format!("{} {}", i, long)).await.unwrap();
        }

        let tail = file.tail(20).await.unwrap();
        assert_eq!(tail.len(), 20);
        assert!(tail[0].contains("] 39 x"));
        assert!(tail[19].contains("] 20 x"));
    }

    #[tokio::test]
    async fn test_clear_truncates() {
        let (_dir, file) = open_temp(LogLevel::Debug).await;
        file.write(LogLevel::Info, "gone soon").await.unwrap();
        file.clear().await.unwrap();

        assert_eq!(file.byte_size().await.unwrap(), 0);
        assert!(file.tail(5).await.unwrap().is_empty());

        file.write(LogLevel::Info, "after clear").await.unwrap();
        assert_eq!(file.line_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_operational_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = OperationalLogs::open(dir.path()).await.unwrap();

        logs.security("Add 198.51.100.7 to the blacklist.").await;
        logs.critical("export sink unreachable").await;

        let secure = logs.secure_log().read_all().await.unwrap();
        assert!(secure.contains("[WARNING] Add 198.51.100.7 to the blacklist."));
        let critical = logs.critical_log().read_all().await.unwrap();
        assert!(critical.contains("[CRITICAL] export sink unreachable"));
    }
}
