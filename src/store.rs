//! Reloadable file-backed stores
//!
//! Each store keeps the parsed contents of one backing file behind an
//! `ArcSwap`. Readers take a snapshot without locking; `reload()` and the
//! write-through operations build a complete new value and publish it with a
//! single pointer swap, so a reader sees either the old or the new snapshot
//! and never a mix of both.
//!
//! Writers (reload, append) are serialised by an async mutex. Files are
//! replaced via write-to-temp + rename so a concurrent reload never parses a
//! half-written file.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Paths, SystemConfig};

/// Interval of the background reload task
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(1);

/// A value that can be persisted to and parsed from a backing file
pub trait Snapshot: Default + Send + Sync + Sized + 'static {
    fn decode(bytes: &[u8]) -> Result<Self>;
    fn encode(&self) -> Result<Vec<u8>>;
}

impl Snapshot for SystemConfig {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Generic file-backed snapshot store
pub struct ReloadableStore<T: Snapshot> {
    path: PathBuf,
    current: ArcSwap<T>,
    write_lock: Mutex<()>,
}

impl<T: Snapshot> ReloadableStore<T> {
    /// Open the store, creating the backing file with `T::default()` if it
    /// does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let value = match tokio::fs::read(&path).await {
            Ok(bytes) => T::decode(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let value = T::default();
                write_atomic(&path, &value.encode()?).await?;
                info!("Created {}", path.display());
                value
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        Ok(Self {
            path,
            current: ArcSwap::from_pointee(value),
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory store for tests and embedding; `reload()` still reads `path`.
    pub fn with_value(path: impl Into<PathBuf>, value: T) -> Self {
        Self {
            path: path.into(),
            current: ArcSwap::from_pointee(value),
            write_lock: Mutex::new(()),
        }
    }

    /// Current snapshot (lock-free)
    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the backing file and swap the snapshot in.
    ///
    /// On a read or parse failure the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let value = T::decode(&bytes)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        self.current.store(Arc::new(value));
        Ok(())
    }

    /// Derive a new value from the current one, persist it, then publish it.
    ///
    /// `update` returns `None` to leave the store untouched.
    pub async fn update<F>(&self, update: F) -> Result<bool>
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let _guard = self.write_lock.lock().await;
        let current = self.current.load_full();
        let next = match update(&current) {
            Some(next) => next,
            None => return Ok(false),
        };

        write_atomic(&self.path, &next.encode()?).await?;
        self.current.store(Arc::new(next));
        Ok(true)
    }

    /// Replace the whole value (write-through)
    pub async fn replace(&self, value: T) -> Result<()> {
        self.update(move |_| Some(value)).await.map(|_| ())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

// =============================================================================
// LIST STORES
// =============================================================================

/// A persisted list of string entries
pub trait EntryList: Snapshot {
    fn entries(&self) -> &[String];

    fn contains(&self, entry: &str) -> bool;

    /// The list with `entry` added, or `None` if adding it changes nothing.
    fn with_entry(&self, entry: &str) -> Option<Self>;

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Deduplicated set of blacklisted origins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginSet {
    entries: Vec<String>,
    index: HashSet<String>,
}

impl OriginSet {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for entry in entries {
            let entry = entry.into();
            if set.index.insert(entry.clone()) {
                set.entries.push(entry);
            }
        }
        set
    }
}

impl Snapshot for OriginSet {
    fn decode(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<String> = serde_json::from_slice(bytes)?;
        Ok(Self::from_entries(entries))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.entries)?)
    }
}

impl EntryList for OriginSet {
    fn entries(&self) -> &[String] {
        &self.entries
    }

    fn contains(&self, entry: &str) -> bool {
        self.index.contains(entry)
    }

    fn with_entry(&self, entry: &str) -> Option<Self> {
        if self.index.contains(entry) {
            return None;
        }
        let mut next = self.clone();
        next.index.insert(entry.to_string());
        next.entries.push(entry.to_string());
        Some(next)
    }
}

/// Ordered list of API keys; duplicates are the caller's business
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyList {
    entries: Vec<String>,
}

impl KeyList {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }
}

impl Snapshot for KeyList {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(serde_json::from_slice(bytes)?))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.entries)?)
    }
}

impl EntryList for KeyList {
    fn entries(&self) -> &[String] {
        &self.entries
    }

    fn contains(&self, entry: &str) -> bool {
        self.entries.iter().any(|key| key == entry)
    }

    fn with_entry(&self, entry: &str) -> Option<Self> {
        let mut next = self.clone();
        next.entries.push(entry.to_string());
        Some(next)
    }
}

/// Store of a persisted entry list
pub struct ListStore<L: EntryList> {
    inner: ReloadableStore<L>,
}

impl<L: EntryList> ListStore<L> {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            inner: ReloadableStore::open(path).await?,
        })
    }

    pub fn with_value(path: impl Into<PathBuf>, value: L) -> Self {
        Self {
            inner: ReloadableStore::with_value(path, value),
        }
    }

    pub fn get(&self) -> Arc<L> {
        self.inner.get()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.inner.get().contains(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.get().is_empty()
    }

    /// Write `entry` through to the file and the cache.
    ///
    /// Returns `false` when the list already made the entry a no-op.
    pub async fn append(&self, entry: &str) -> Result<bool> {
        self.inner.update(|current| current.with_entry(entry)).await
    }

    pub async fn reload(&self) -> Result<()> {
        self.inner.reload().await
    }
}

pub type ConfigStore = ReloadableStore<SystemConfig>;
pub type BlacklistStore = ListStore<OriginSet>;
pub type CredentialStore = ListStore<KeyList>;

// =============================================================================
// STORE SET
// =============================================================================

/// The three stores refreshed by the reload task
#[derive(Clone)]
pub struct StoreSet {
    pub system: Arc<ConfigStore>,
    pub blacklist: Arc<BlacklistStore>,
    pub credentials: Arc<CredentialStore>,
}

impl StoreSet {
    pub async fn open(paths: &Paths) -> Result<Self> {
        Ok(Self {
            system: Arc::new(ConfigStore::open(paths.system_config()).await?),
            blacklist: Arc::new(BlacklistStore::open(paths.blacklist()).await?),
            credentials: Arc::new(CredentialStore::open(paths.api_keys()).await?),
        })
    }

    /// Reload all stores; each failure is logged and the others still run.
    pub async fn reload_all(&self) -> usize {
        let mut failures = 0;

        if let Err(e) = self.system.reload().await {
            warn!("System config reload failed: {:#}", e);
            failures += 1;
        }
        if let Err(e) = self.blacklist.reload().await {
            warn!("Blacklist reload failed: {:#}", e);
            failures += 1;
        }
        if let Err(e) = self.credentials.reload().await {
            warn!("API key list reload failed: {:#}", e);
            failures += 1;
        }

        failures
    }

    /// Start the periodic reload task
    pub fn spawn_reload_task(&self, period: Duration) -> JoinHandle<()> {
        let stores = self.clone();
        info!("Starting store reload task (interval: {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let failures = stores.reload_all().await;
                if failures == 0 {
                    debug!("Stores reloaded");
                }
            }
        })
    }
}
