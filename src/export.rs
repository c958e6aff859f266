//! Paged export of accepted records
//!
//! Every five seconds the pending records in the `LogBuffer` are appended to
//! a spreadsheet-like sink made of fixed-size pages. Each page has one header
//! row and room for 5000 data rows. Pages are titled `"{start}-{end}"`, where
//! `start` is the number of records exported before the page and `end` the
//! number exported once its last row was written, so the titles partition
//! the whole export stream without gaps:
//!
//! ```text
//!   page "0-5000"      rows 2..=5001  -> records 1..=5000
//!   page "5000-5001"   row  2         -> record  5001
//! ```
//!
//! A cycle never writes past the current page: when the buffer holds more
//! than the page can take, only the prefix that fits is drained and the rest
//! waits for the next cycle.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ExportConfig, ExportKind, Paths};
use crate::lock_utils::lock_or_recover;
use crate::log_buffer::{LogBuffer, LogRecord};
use crate::log_file::OperationalLogs;

/// Interval of the export task
pub const EXPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Total rows per page, header included
pub const PAGE_ROWS: usize = 5001;

/// Data rows per page
pub const PAGE_DATA_ROWS: usize = PAGE_ROWS - 1;

/// Columns per page: level, timestamp, message
pub const PAGE_COLS: usize = 3;

pub const HEADER_ROW: [&str; PAGE_COLS] = ["Level", "Timestamp", "Message"];

// =============================================================================
// PAGE
// =============================================================================

/// Position of one page in the export stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExportPage {
    pub start: u64,
    pub end: u64,
}

impl ExportPage {
    pub fn first() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Parse a `"{start}-{end}"` title
    pub fn parse_title(title: &str) -> Option<Self> {
        let (start, end) = title.split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = end.parse().ok()?;
        if end < start || (end - start) as usize > PAGE_DATA_ROWS {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn title(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }

    pub fn data_rows(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Rows in use, header included
    pub fn filled_rows(&self) -> usize {
        self.data_rows() + 1
    }

    pub fn remaining(&self) -> usize {
        PAGE_ROWS - self.filled_rows()
    }

    pub fn is_full(&self) -> bool {
        self.filled_rows() >= PAGE_ROWS
    }

    /// 1-based row index of the next free row
    pub fn next_free_row(&self) -> usize {
        self.filled_rows() + 1
    }

    /// The page that follows this one
    pub fn successor(&self) -> Self {
        Self {
            start: self.end,
            end: self.end,
        }
    }

    /// This page after `count` more data rows
    pub fn advanced(&self, count: usize) -> Self {
        Self {
            start: self.start,
            end: self.end + count as u64,
        }
    }
}

fn record_row(record: &LogRecord) -> Vec<String> {
    vec![
        record.level.as_u8().to_string(),
        record.timestamp.clone(),
        record.message.clone(),
    ]
}

fn header_row() -> Vec<Vec<String>> {
    vec![HEADER_ROW.iter().map(|s| s.to_string()).collect()]
}

// =============================================================================
// SINK
// =============================================================================

/// A workbook of titled, fixed-size pages (worksheets)
#[async_trait]
pub trait PagedSink: Send + Sync {
    /// Page titles in workbook order
    async fn pages(&self) -> Result<Vec<String>>;

    async fn add_page(&self, title: &str, rows: usize, cols: usize) -> Result<()>;

    async fn delete_page(&self, title: &str) -> Result<()>;

    /// Write `rows` starting at 1-based row `first_row`
    async fn write_rows(&self, title: &str, first_row: usize, rows: &[Vec<String>]) -> Result<()>;

    async fn rename_page(&self, title: &str, new_title: &str) -> Result<()>;
}

/// Stored page contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageData {
    pub row_limit: usize,
    pub col_limit: usize,
    /// Rows written so far, row 1 first
    pub rows: Vec<Vec<String>>,
}

impl PageData {
    fn new(row_limit: usize, col_limit: usize) -> Self {
        Self {
            row_limit,
            col_limit,
            rows: Vec::new(),
        }
    }

    fn write(&mut self, first_row: usize, rows: &[Vec<String>]) -> Result<()> {
        if first_row == 0 {
            bail!("Row indices are 1-based");
        }
        let last_row = first_row + rows.len() - 1;
        if last_row > self.row_limit {
            bail!("Row {} exceeds page limit {}", last_row, self.row_limit);
        }
        if first_row > self.rows.len() + 1 {
            bail!(
                "Row {} leaves a gap after row {}",
                first_row,
                self.rows.len()
            );
        }
        if let Some(row) = rows.iter().find(|r| r.len() > self.col_limit) {
            bail!("Row with {} columns exceeds limit {}", row.len(), self.col_limit);
        }

        for (offset, row) in rows.iter().enumerate() {
            let index = first_row - 1 + offset;
            if index < self.rows.len() {
                self.rows[index] = row.clone();
            } else {
                self.rows.push(row.clone());
            }
        }
        Ok(())
    }
}

/// In-process workbook
#[derive(Debug, Default)]
pub struct MemorySink {
    pages: Mutex<Vec<(String, PageData)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workbook holding one untitled default page, like a fresh spreadsheet
    pub fn with_default_page() -> Self {
        let sink = Self::new();
        lock_or_recover(&sink.pages, "memory sink")
            .push(("Sheet1".to_string(), PageData::new(1000, 26)));
        sink
    }

    pub fn page(&self, title: &str) -> Option<PageData> {
        lock_or_recover(&self.pages, "memory sink")
            .iter()
            .find(|(t, _)| t == title)
            .map(|(_, data)| data.clone())
    }

    pub fn titles(&self) -> Vec<String> {
        lock_or_recover(&self.pages, "memory sink")
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }
}

#[async_trait]
impl PagedSink for MemorySink {
    async fn pages(&self) -> Result<Vec<String>> {
        Ok(self.titles())
    }

    async fn add_page(&self, title: &str, rows: usize, cols: usize) -> Result<()> {
        let mut pages = lock_or_recover(&self.pages, "memory sink");
        if pages.iter().any(|(t, _)| t == title) {
            bail!("Page {} already exists", title);
        }
        pages.push((title.to_string(), PageData::new(rows, cols)));
        Ok(())
    }

    async fn delete_page(&self, title: &str) -> Result<()> {
        let mut pages = lock_or_recover(&self.pages, "memory sink");
        let before = pages.len();
        pages.retain(|(t, _)| t != title);
        if pages.len() == before {
            bail!("Page {} not found", title);
        }
        Ok(())
    }

    async fn write_rows(&self, title: &str, first_row: usize, rows: &[Vec<String>]) -> Result<()> {
        let mut pages = lock_or_recover(&self.pages, "memory sink");
        let (_, data) = pages
            .iter_mut()
            .find(|(t, _)| t == title)
            .ok_or_else(|| anyhow!("Page {} not found", title))?;
        data.write(first_row, rows)
    }

    async fn rename_page(&self, title: &str, new_title: &str) -> Result<()> {
        let mut pages = lock_or_recover(&self.pages, "memory sink");
        if title != new_title && pages.iter().any(|(t, _)| t == new_title) {
            bail!("Page {} already exists", new_title);
        }
        let (t, _) = pages
            .iter_mut()
            .find(|(t, _)| t == title)
            .ok_or_else(|| anyhow!("Page {} not found", title))?;
        *t = new_title.to_string();
        Ok(())
    }
}

/// Workbook stored as one JSON file per page
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create export dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn page_path(&self, title: &str) -> PathBuf {
        self.dir.join(format!("{}.json", title))
    }

    async fn load(&self, title: &str) -> Result<PageData> {
        let path = self.page_path(title);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Page {} not found", title))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Corrupt page {}", path.display()))
    }

    async fn store(&self, title: &str, data: &PageData) -> Result<()> {
        let path = self.page_path(title);
        let tmp = self.dir.join(format!(".{}.json.tmp", title));
        tokio::fs::write(&tmp, serde_json::to_vec(data)?)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PagedSink for DirectorySink {
    async fn pages(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut titles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(title) = name.strip_suffix(".json") {
                titles.push(title.to_string());
            }
        }

        // Workbook order: foreign pages first, then export pages by position
        titles.sort_by_key(|t| match ExportPage::parse_title(t) {
            Some(page) => (1, page, String::new()),
            None => (0, ExportPage::first(), t.clone()),
        });
        Ok(titles)
    }

    async fn add_page(&self, title: &str, rows: usize, cols: usize) -> Result<()> {
        if tokio::fs::try_exists(self.page_path(title)).await? {
            bail!("Page {} already exists", title);
        }
        self.store(title, &PageData::new(rows, cols)).await
    }

    async fn delete_page(&self, title: &str) -> Result<()> {
        tokio::fs::remove_file(self.page_path(title))
            .await
            .with_context(|| format!("Failed to delete page {}", title))
    }

    async fn write_rows(&self, title: &str, first_row: usize, rows: &[Vec<String>]) -> Result<()> {
        let mut data = self.load(title).await?;
        data.write(first_row, rows)?;
        self.store(title, &data).await
    }

    async fn rename_page(&self, title: &str, new_title: &str) -> Result<()> {
        if title == new_title {
            return Ok(());
        }
        if tokio::fs::try_exists(self.page_path(new_title)).await? {
            bail!("Page {} already exists", new_title);
        }
        tokio::fs::rename(self.page_path(title), self.page_path(new_title))
            .await
            .with_context(|| format!("Failed to rename page {} to {}", title, new_title))
    }
}

/// Build the sink configured for a stream
pub async fn build_sink(config: &ExportConfig, paths: &Paths) -> Result<Arc<dyn PagedSink>> {
    match config.kind {
        ExportKind::Memory => Ok(Arc::new(MemorySink::new())),
        ExportKind::Directory => {
            let target = config
                .target
                .as_ref()
                .ok_or_else(|| anyhow!("Directory export requires a target"))?;
            let dir = paths.export_target(target);
            info!("Exporting to directory {}", dir.display());
            Ok(Arc::new(DirectorySink::open(dir).await?))
        }
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Result of one export cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOutcome {
    /// Page state after the cycle
    pub page: ExportPage,
    /// Records written in this cycle
    pub exported: usize,
}

/// Drains the log buffer into a paged sink
pub struct ExportScheduler {
    sink: Arc<dyn PagedSink>,
    buffer: Arc<LogBuffer>,
    logs: Arc<OperationalLogs>,
}

impl ExportScheduler {
    pub fn new(sink: Arc<dyn PagedSink>, buffer: Arc<LogBuffer>, logs: Arc<OperationalLogs>) -> Self {
        Self { sink, buffer, logs }
    }

    /// Run one export cycle. `Ok(None)` when there was nothing to export.
    ///
    /// On error every drained record is back at the front of the buffer.
    pub async fn run_cycle(&self) -> Result<Option<ExportOutcome>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut page = self.current_page().await?;
        if page.is_full() {
            page = self.open_page(page.successor()).await?;
        }
        if page.data_rows() == 0 {
            // Repeated until the first record lands
            self.write_header(page).await?;
        }

        let drained = self.buffer.drain_front(page.remaining());
        if drained.is_empty() {
            return Ok(None);
        }

        match self.write_batch(page, &drained).await {
            Ok(updated) => {
                debug!(
                    "Exported {} records to page {} ({} pending)",
                    drained.len(),
                    updated.title(),
                    self.buffer.len()
                );
                Ok(Some(ExportOutcome {
                    page: updated,
                    exported: drained.len(),
                }))
            }
            Err(e) => {
                // The page title only advances after the rows are in, so a
                // retry rewrites the same rows with the same records.
                self.buffer.restore_front(drained);
                Err(e)
            }
        }
    }

    /// Last export page, bootstrapping the workbook if it has none
    async fn current_page(&self) -> Result<ExportPage> {
        let titles = self.sink.pages().await?;
        let page = match titles.iter().rev().find_map(|t| ExportPage::parse_title(t)) {
            Some(page) => page,
            None => {
                let page = self.open_page(ExportPage::first()).await?;
                info!("Initialised export workbook with page {}", page.title());
                page
            }
        };

        // Default pages go once the workbook holds export pages only
        if page == ExportPage::first() {
            for foreign in titles.iter().filter(|t| ExportPage::parse_title(t).is_none()) {
                self.sink
                    .delete_page(foreign)
                    .await
                    .with_context(|| format!("Failed to remove default page {}", foreign))?;
            }
        }
        Ok(page)
    }

    /// Create an empty page. The header is written by `run_cycle`.
    async fn open_page(&self, page: ExportPage) -> Result<ExportPage> {
        let title = page.title();
        self.sink
            .add_page(&title, PAGE_ROWS, PAGE_COLS)
            .await
            .with_context(|| format!("Failed to add page {}", title))?;
        info!("Opened export page {}", title);
        Ok(page)
    }

    async fn write_header(&self, page: ExportPage) -> Result<()> {
        let title = page.title();
        self.sink
            .write_rows(&title, 1, &header_row())
            .await
            .with_context(|| format!("Failed to write header of page {}", title))
    }

    async fn write_batch(&self, page: ExportPage, records: &[LogRecord]) -> Result<ExportPage> {
        let rows: Vec<Vec<String>> = records.iter().map(record_row).collect();
        let title = page.title();
        self.sink
            .write_rows(&title, page.next_free_row(), &rows)
            .await
            .with_context(|| format!("Failed to write rows to page {}", title))?;

        let updated = page.advanced(records.len());
        self.sink
            .rename_page(&title, &updated.title())
            .await
            .with_context(|| format!("Failed to retitle page {}", title))?;
        Ok(updated)
    }

    /// Start the periodic export.
    ///
    /// The task stops between cycles once `shutdown` turns true (or its
    /// sender is dropped); a cycle in flight always runs to completion.
    pub fn spawn_export_task(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        info!("Starting export task (interval: {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if let Err(e) = scheduler.run_cycle().await {
                    scheduler
                        .logs
                        .critical(&format!(
                            "Export cycle abandoned, {} records kept for retry: {:#}",
                            scheduler.buffer.len(),
                            e
                        ))
                        .await;
                }
            }
            debug!("Export task stopped");
        })
    }
}
