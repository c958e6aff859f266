//! Node configuration
//!
//! Two layers:
//! - `Config` (`server.toml`): static server, CORS, rate limit and stream
//!   settings, loaded once at startup.
//! - `SystemConfig` (`system.json`): runtime switches swapped in wholesale by
//!   the reload task (see `store`).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::log_buffer::LogLevel;

/// Default abuse threshold (requests per sweep interval)
pub const DEFAULT_DOS_DETECT_THRESHOLD: u64 = 5000;

/// Common path prefix of every endpoint
pub const API_PREFIX: &str = "/aegis/log";

/// Static node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Log streams by name; each `run` serves exactly one
    #[serde(default)]
    pub streams: BTreeMap<String, StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Value of the `Server` header unless `headers` already sets one
    pub server_name: String,
    /// Extra headers attached to every screened response
    pub headers: BTreeMap<String, String>,
    /// Reject blacklisted origins in the gatekeeper
    pub blacklist_filter: bool,
    /// Allowed referers; empty disables the referer check
    pub referer_allow_list: Vec<String>,
    /// Upper bound for request bodies in bytes
    pub max_body_bytes: usize,
    pub cors: CorsConfig,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: format!("AegisLogIngest({})", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
            blacklist_filter: true,
            referer_allow_list: Vec::new(),
            // 1024 records of 8192 chars, JSON encoded, with headroom
            max_body_bytes: 48 * 1024 * 1024,
            cors: CorsConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub allow_headers: Vec<String>,
    pub allow_methods: Vec<String>,
    pub max_age: u64,
    pub expose_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: false,
            allow_headers: vec!["*".to_string()],
            allow_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            max_age: 600,
            expose_headers: Vec::new(),
        }
    }
}

/// Certificate paths. TLS is terminated in front of the node; the paths are
/// only reported at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Request budget per window
    pub requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Shared Redis/DragonflyDB storage; in-memory when unset
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: 600,
            window_secs: 60,
            redis_url: None,
        }
    }
}

/// One log stream: where it listens and where it writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_ipv6: bool,
    /// Output file; relative paths resolve under the client log directory
    pub file: PathBuf,
    /// Minimum level written to the file (0..=4)
    #[serde(default = "default_stream_level")]
    pub level: u8,
    #[serde(default)]
    pub export: Option<ExportConfig>,
}

fn default_stream_level() -> u8 {
    0
}

impl StreamConfig {
    pub fn min_level(&self) -> LogLevel {
        LogLevel::from_i64(i64::from(self.level)).unwrap_or(LogLevel::Debug)
    }

    pub fn resolve_file(&self, paths: &Paths) -> PathBuf {
        if self.file.is_absolute() {
            self.file.clone()
        } else {
            paths.client_log_dir.join(&self.file)
        }
    }

    pub fn bind_addr(&self) -> String {
        if self.use_ipv6 && self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    /// One JSON file per page in a directory
    Directory,
    /// In-process pages (testing / dry runs)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub kind: ExportKind,
    /// Directory for `kind = "directory"`; relative to the config dir
    #[serde(default)]
    pub target: Option<PathBuf>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents).context("TOML parse error")?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit.enabled {
            if self.rate_limit.requests == 0 {
                anyhow::bail!("Invalid rate_limit.requests: must be > 0");
            }
            if self.rate_limit.window_secs == 0 {
                anyhow::bail!("Invalid rate_limit.window_secs: must be > 0");
            }
        }

        if self.server.max_body_bytes == 0 {
            anyhow::bail!("Invalid server.max_body_bytes: must be > 0");
        }

        for (name, stream) in &self.streams {
            if stream.port == 0 {
                anyhow::bail!("Invalid port for stream '{}': cannot be 0", name);
            }
            if stream.level > 4 {
                anyhow::bail!("Invalid level {} for stream '{}': must be 0-4", stream.level, name);
            }
            if let Some(export) = &stream.export {
                if export.kind == ExportKind::Directory && export.target.is_none() {
                    anyhow::bail!("Stream '{}': directory export requires a target", name);
                }
            }
        }

        Ok(())
    }

    pub fn stream(&self, name: &str) -> anyhow::Result<&StreamConfig> {
        self.streams
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown log stream <{}>", name))
    }
}

/// Runtime switches, reloaded every second
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SystemConfigFile")]
pub struct SystemConfig {
    /// Reject every request with 503
    pub maintenance_mode: bool,
    /// Requests per sweep interval above which an origin is blacklisted
    pub dos_detect_threshold: u64,
    /// Credential for the file management endpoints; unset disables them
    pub root_pass: Option<String>,
}

/// `system.json` as written on disk. The threshold may also appear under
/// its older name `dos_detect`; `dos_detect_threshold` wins when both are set.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SystemConfigFile {
    maintenance_mode: bool,
    dos_detect_threshold: Option<u64>,
    dos_detect: Option<u64>,
    root_pass: Option<String>,
}

impl From<SystemConfigFile> for SystemConfig {
    fn from(file: SystemConfigFile) -> Self {
        Self {
            maintenance_mode: file.maintenance_mode,
            dos_detect_threshold: file
                .dos_detect_threshold
                .or(file.dos_detect)
                .unwrap_or(DEFAULT_DOS_DETECT_THRESHOLD),
            root_pass: file.root_pass,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            maintenance_mode: false,
            dos_detect_threshold: DEFAULT_DOS_DETECT_THRESHOLD,
            root_pass: None,
        }
    }
}

/// Filesystem layout derived from the config directory
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    /// Operational logs (`secure.log`, `critical.log`)
    pub log_dir: PathBuf,
    /// Client stream output files
    pub client_log_dir: PathBuf,
}

impl Paths {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let top = config_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            log_dir: top.join("logs"),
            client_log_dir: top.join("client_logs"),
            config_dir,
        }
    }

    /// Create the directories if they do not exist
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.config_dir, &self.log_dir, &self.client_log_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn server_config(&self) -> PathBuf {
        self.config_dir.join("server.toml")
    }

    pub fn system_config(&self) -> PathBuf {
        self.config_dir.join("system.json")
    }

    pub fn blacklist(&self) -> PathBuf {
        self.config_dir.join("ip_blacklist.json")
    }

    pub fn api_keys(&self) -> PathBuf {
        self.config_dir.join("api_key.json")
    }

    pub fn export_target(&self, target: &Path) -> PathBuf {
        if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.config_dir.join(target)
        }
    }
}
