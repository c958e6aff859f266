//! Endpoint handlers
//!
//! Ingestion (`save-log`, `save-logs`) is open to anything the gatekeeper
//! admits. File management (`details`, `download-logs`, `get-logs`,
//! `get-latest-logs`, `clear-logs`) also needs the root password.

use hyper::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::ServiceError;
use crate::log_buffer::{LogBuffer, LogLevel, LogRecord, MAX_MESSAGE_LENGTH};
use crate::log_file::{LogFile, OperationalLogs};
use crate::params::Params;
use crate::store::ConfigStore;

/// Most entries accepted by one `save-logs` call
pub const MAX_BATCH_ENTRIES: usize = 1024;

/// Lines returned by `get-latest-logs`
pub const LATEST_LINES: usize = 1024;

const SUCCESS: &str = "success.";

type HandlerResult = Result<Response<Body>, ServiceError>;

// =============================================================================
// VALIDATION
// =============================================================================

/// `level` as an integer 0..=4, `Info` when absent
fn parse_level(value: Option<&Value>) -> Result<LogLevel, ServiceError> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(LogLevel::default()),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    raw.and_then(LogLevel::from_i64)
        .ok_or_else(|| ServiceError::validation("level must be an integer between 0 and 4"))
}

/// `message`, falling back to `msg`
fn parse_message(message: Option<&Value>, msg: Option<&Value>) -> Result<String, ServiceError> {
    let value = message
        .or(msg)
        .ok_or_else(|| ServiceError::validation("message is required"))?;
    let text = value
        .as_str()
        .ok_or_else(|| ServiceError::validation("message must be a string"))?;
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ServiceError::validation(format!(
            "message exceeds {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }
    Ok(text.to_string())
}

fn parse_entry(index: usize, entry: &Value) -> Result<LogRecord, ServiceError> {
    let object = entry
        .as_object()
        .ok_or_else(|| ServiceError::validation(format!("logs[{}] must be an object", index)))?;
    let level = parse_level(object.get("level"))
        .map_err(|e| ServiceError::validation(format!("logs[{}]: {}", index, e)))?;
    let message = parse_message(object.get("message"), object.get("msg"))
        .map_err(|e| ServiceError::validation(format!("logs[{}]: {}", index, e)))?;
    Ok(LogRecord::new(level, message))
}

/// Validate a whole batch; any bad entry rejects all of them
fn parse_batch(params: &Params) -> Result<Vec<LogRecord>, ServiceError> {
    let parsed;
    let entries = match params.get("logs") {
        Some(Value::Array(entries)) => entries,
        // Form submissions carry the list as a JSON string
        Some(Value::String(text)) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|_| ServiceError::validation("logs must be a list"))?;
            parsed
                .as_array()
                .ok_or_else(|| ServiceError::validation("logs must be a list"))?
        }
        Some(_) => return Err(ServiceError::validation("logs must be a list")),
        None => return Err(ServiceError::validation("logs is required")),
    };

    if entries.len() > MAX_BATCH_ENTRIES {
        return Err(ServiceError::validation(format!(
            "logs exceeds {} entries",
            MAX_BATCH_ENTRIES
        )));
    }

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| parse_entry(i, entry))
        .collect()
}

fn sink_error(err: anyhow::Error) -> ServiceError {
    ServiceError::Sink(format!("{:#}", err))
}

/// Size in MiB, two decimals
fn size_in_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

// =============================================================================
// RESPONSES
// =============================================================================

fn text_response(body: impl Into<Body>) -> HandlerResult {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.into())
        .map_err(|e| ServiceError::Internal(e.to_string()))
}

fn json_response(value: &Value) -> HandlerResult {
    let body = serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| ServiceError::Internal(e.to_string()))
}

/// Error response carrying the public message
pub fn error_response(error: &ServiceError) -> Response<Body> {
    let mut response = Response::new(Body::from(error.public_message()));
    *response.status_mut() = error.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let ServiceError::RateLimited { retry_after_secs } = error {
        response.headers_mut().insert(
            hyper::header::RETRY_AFTER,
            hyper::header::HeaderValue::from(*retry_after_secs),
        );
    }
    response
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Handlers for one log stream
pub struct LogHandlers {
    stream_name: String,
    stream: StreamConfig,
    log_file: Arc<LogFile>,
    /// Records waiting for export; `None` when the stream does not export
    buffer: Option<Arc<LogBuffer>>,
    system: Arc<ConfigStore>,
    logs: Arc<OperationalLogs>,
}

impl LogHandlers {
    pub fn new(
        stream_name: impl Into<String>,
        stream: StreamConfig,
        log_file: Arc<LogFile>,
        buffer: Option<Arc<LogBuffer>>,
        system: Arc<ConfigStore>,
        logs: Arc<OperationalLogs>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            stream,
            log_file,
            buffer,
            system,
            logs,
        }
    }

    /// Route `endpoint` (the path below the API prefix)
    pub async fn dispatch(&self, endpoint: &str, origin: &str, params: &Params) -> HandlerResult {
        match endpoint {
            "save-log" => self.save_log(params).await,
            "save-logs" => self.save_logs(params).await,
            "details" => {
                self.require_root(origin, params).await?;
                self.details().await
            }
            "download-logs" => {
                self.require_root(origin, params).await?;
                self.download_logs().await
            }
            "get-logs" => {
                self.require_root(origin, params).await?;
                self.get_logs().await
            }
            "get-latest-logs" => {
                self.require_root(origin, params).await?;
                self.get_latest_logs().await
            }
            "clear-logs" => {
                self.require_root(origin, params).await?;
                self.clear_logs().await
            }
            _ => Err(ServiceError::NotFound),
        }
    }

    /// Check `root_pass` against the system config in constant time
    async fn require_root(&self, origin: &str, params: &Params) -> Result<(), ServiceError> {
        let system = self.system.get();
        let Some(expected) = system.root_pass.as_deref() else {
            return Err(ServiceError::authorization("Root access is disabled"));
        };

        let presented = params.get_str("root_pass").unwrap_or("");
        let valid: bool = expected.as_bytes().ct_eq(presented.as_bytes()).into();
        if !valid {
            self.logs
                .security(&format!("Rejected root access from {} <root_pass>", origin))
                .await;
            return Err(ServiceError::authorization("Invalid root password"));
        }
        Ok(())
    }

    /// Buffer and persist accepted records. A failed file write is logged;
    /// the request still succeeds.
    async fn accept(&self, records: Vec<LogRecord>) {
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.log_file.write_records(&records).await {
            self.logs
                .critical(&format!(
                    "Failed to write {} record(s) to {}: {:#}",
                    records.len(),
                    self.log_file.path().display(),
                    e
                ))
                .await;
        }
        if let Some(buffer) = &self.buffer {
            buffer.extend(records);
        }
    }

    async fn save_log(&self, params: &Params) -> HandlerResult {
        let level = parse_level(params.get("level"))?;
        let message = parse_message(params.get("message"), params.get("msg"))?;
        self.accept(vec![LogRecord::new(level, message)]).await;
        text_response(SUCCESS)
    }

    async fn save_logs(&self, params: &Params) -> HandlerResult {
        let records = parse_batch(params)?;
        debug!("Accepted batch of {} records for <{}>", records.len(), self.stream_name);
        self.accept(records).await;
        text_response(SUCCESS)
    }

    async fn details(&self) -> HandlerResult {
        let count = self.log_file.line_count().await.map_err(sink_error)?;
        let size = self.log_file.byte_size().await.map_err(sink_error)?;
        json_response(&json!({
            "name": self.stream_name,
            "host": self.stream.host,
            "port": self.stream.port,
            "use_ipv6": self.stream.use_ipv6,
            "file": self.log_file.path().display().to_string(),
            "count": count,
            "size": size,
            "size_mb": size_in_mb(size),
        }))
    }

    async fn download_logs(&self) -> HandlerResult {
        let bytes = self.log_file.read_bytes().await.map_err(sink_error)?;
        let filename = self
            .log_file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.log", self.stream_name));

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename.replace('"', "")),
            )
            .body(Body::from(bytes))
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    async fn get_logs(&self) -> HandlerResult {
        text_response(self.log_file.read_all().await.map_err(sink_error)?)
    }

    async fn get_latest_logs(&self) -> HandlerResult {
        let lines = self.log_file.tail(LATEST_LINES).await.map_err(sink_error)?;
        json_response(&json!(lines))
    }

    async fn clear_logs(&self) -> HandlerResult {
        self.log_file.clear().await.map_err(sink_error)?;
        self.logs
            .security(&format!("Cleared log file of <{}>", self.stream_name))
            .await;
        text_response(SUCCESS)
    }
}
