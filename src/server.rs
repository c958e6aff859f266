//! HTTP front of one log stream
//!
//! `AppState` owns every component; `handle_request` is the hyper service
//! body and `run_server` binds the listener and starts the periodic tasks:
//!
//! - store reload, every second
//! - abuse sweep, every five seconds
//! - export, every five seconds (when the stream exports)
//! - rate limiter purge (in-memory storage only)

use anyhow::{Context, Result};
use futures::FutureExt;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, Paths, StreamConfig, API_PREFIX};
use crate::detector::{AnomalyDetector, OriginCounter, SWEEP_INTERVAL};
use crate::error::ServiceError;
use crate::export::{build_sink, ExportScheduler, EXPORT_INTERVAL};
use crate::gatekeeper::{Gatekeeper, Rejection, RequestInfo};
use crate::handlers::{error_response, LogHandlers};
use crate::log_buffer::LogBuffer;
use crate::log_file::{LogFile, OperationalLogs};
use crate::params::{read_body_limited, Params};
use crate::rate_limiter::ElasticWindowLimiter;
use crate::store::{StoreSet, RELOAD_INTERVAL};

/// Shared state of a running stream
pub struct AppState {
    pub stream_name: String,
    pub stream: StreamConfig,
    pub max_body_bytes: usize,
    pub stores: StoreSet,
    pub limiter: Arc<ElasticWindowLimiter>,
    pub detector: Arc<AnomalyDetector>,
    pub log_file: Arc<LogFile>,
    pub logs: Arc<OperationalLogs>,
    pub exporter: Option<Arc<ExportScheduler>>,
    pub gatekeeper: Gatekeeper,
    pub handlers: LogHandlers,
}

impl AppState {
    /// Open stores, files and sinks for `stream_name`
    pub async fn build(config: &Config, paths: &Paths, stream_name: &str) -> Result<Self> {
        let stream = config.stream(stream_name)?.clone();
        paths.ensure()?;

        let stores = StoreSet::open(paths).await?;
        let logs = Arc::new(OperationalLogs::open(&paths.log_dir).await?);
        let log_file = Arc::new(
            LogFile::open(stream.resolve_file(paths), stream.min_level())
                .await
                .context("Failed to open stream log file")?,
        );

        let limiter = Arc::new(ElasticWindowLimiter::from_config(&config.rate_limit).await?);
        let counter = Arc::new(OriginCounter::new());
        let detector = Arc::new(AnomalyDetector::new(
            Arc::clone(&counter),
            Arc::clone(&stores.blacklist),
            Arc::clone(&stores.system),
            Arc::clone(&logs),
        ));

        let (buffer, exporter) = match &stream.export {
            Some(export) => {
                let buffer = Arc::new(LogBuffer::new());
                let sink = build_sink(export, paths).await?;
                let scheduler = ExportScheduler::new(sink, Arc::clone(&buffer), Arc::clone(&logs));
                (Some(buffer), Some(Arc::new(scheduler)))
            }
            None => {
                info!("Export disabled for <{}>", stream_name);
                (None, None)
            }
        };

        let gatekeeper = Gatekeeper::new(
            &config.server,
            stores.clone(),
            Arc::clone(&limiter),
            counter,
        )?;
        let handlers = LogHandlers::new(
            stream_name,
            stream.clone(),
            Arc::clone(&log_file),
            buffer,
            Arc::clone(&stores.system),
            Arc::clone(&logs),
        );

        Ok(Self {
            stream_name: stream_name.to_string(),
            stream,
            max_body_bytes: config.server.max_body_bytes,
            stores,
            limiter,
            detector,
            log_file,
            logs,
            exporter,
            gatekeeper,
            handlers,
        })
    }

    /// Start the periodic tasks
    pub fn spawn_background_tasks(&self) -> BackgroundTasks {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut periodic = vec![
            self.stores.spawn_reload_task(RELOAD_INTERVAL),
            self.detector.spawn_sweep_task(SWEEP_INTERVAL),
        ];
        if self.limiter.is_enabled() {
            periodic.push(self.limiter.spawn_purge_task());
        }
        let export = self
            .exporter
            .as_ref()
            .map(|exporter| exporter.spawn_export_task(EXPORT_INTERVAL, shutdown_rx));

        BackgroundTasks {
            periodic,
            export,
            shutdown,
        }
    }

    /// Stop the background tasks, then export whatever is still buffered
    pub async fn shutdown(&self, tasks: BackgroundTasks) {
        tasks.stop().await;

        if let Some(exporter) = &self.exporter {
            loop {
                match exporter.run_cycle().await {
                    Ok(Some(outcome)) => debug!("Final export of {} records", outcome.exported),
                    Ok(None) => break,
                    Err(e) => {
                        self.logs
                            .critical(&format!("Final export failed: {:#}", e))
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

/// Handles of the periodic tasks of a running stream
pub struct BackgroundTasks {
    periodic: Vec<JoinHandle<()>>,
    export: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl BackgroundTasks {
    /// Abort the stateless tasks. The export task finishes its current
    /// cycle first, so no drained batch is dropped.
    pub async fn stop(self) {
        for task in self.periodic {
            task.abort();
        }
        let _ = self.shutdown.send(true);
        if let Some(export) = self.export {
            if let Err(e) = export.await {
                warn!("Export task ended abnormally: {}", e);
            }
        }
    }
}

/// Endpoint name below the API prefix, if the path is under it
fn endpoint_of(path: &str) -> Option<&str> {
    path.strip_prefix(API_PREFIX)?
        .strip_prefix('/')
        .map(|rest| rest.trim_end_matches('/'))
}

fn rejection_response(rejection: Rejection) -> Response<Body> {
    let mut response = error_response(&rejection.error);
    response.headers_mut().extend(rejection.headers);
    response
}

/// Screen, route and answer one request
pub async fn handle_request(
    state: Arc<AppState>,
    req: Request<Body>,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    let start_time = Instant::now();
    let origin = remote_addr.ip().to_string();
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let mut params = Params::from_query(parts.uri.query().unwrap_or(""));
    let head = RequestInfo::new(origin.as_str(), parts.method.clone(), path.as_str())
        .with_headers(&parts.headers, params.get_str("api_key"));
    if let Err(rejection) = state.gatekeeper.screen_head(&head) {
        return Ok(rejection_response(rejection));
    }

    // The API key may be in the body, so the rest of screening waits for it
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let body_outcome = match read_body_limited(body, state.max_body_bytes).await {
        Ok(bytes) => params.merge_body(content_type, &bytes),
        Err(e) => Err(e),
    };

    let info = head.with_headers(&parts.headers, params.get_str("api_key"));
    let admission = match state.gatekeeper.screen(&info).await {
        Ok(admission) => admission,
        Err(rejection) => return Ok(rejection_response(rejection)),
    };

    let result = match (body_outcome, endpoint_of(&path)) {
        (Err(e), _) => Err(e),
        (Ok(()), None) => Err(ServiceError::NotFound),
        (Ok(()), Some(endpoint)) => {
            let call = state.handlers.dispatch(endpoint, &origin, &params);
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    state
                        .logs
                        .critical(&format!("Handler for {} panicked: {}", path, detail))
                        .await;
                    Err(ServiceError::Internal(detail))
                }
            }
        }
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ServiceError::Internal(detail) | ServiceError::Sink(detail) => {
                    warn!("{} {} from {} failed: {}", parts.method, path, origin, detail);
                }
                other => debug!("{} {} from {}: {}", parts.method, path, origin, other),
            }
            error_response(&e)
        }
    };
    response.headers_mut().extend(admission.headers);

    debug!(
        "{} {} {} -> {} ({:?})",
        origin,
        parts.method,
        path,
        response.status(),
        start_time.elapsed()
    );
    Ok(response)
}

/// Serve one stream until Ctrl+C
pub async fn run_server(config: Config, paths: Paths, stream_name: &str) -> Result<()> {
    config.validate()?;
    let state = Arc::new(AppState::build(&config, &paths, stream_name).await?);

    let addr: SocketAddr = state
        .stream
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid listen address {}", state.stream.bind_addr()))?;

    if let (Some(cert), Some(key)) = (&config.server.tls.cert, &config.server.tls.key) {
        info!(
            "TLS certificate {} / key {} configured; terminate TLS in front of this node",
            cert.display(),
            key.display()
        );
    }

    let tasks = state.spawn_background_tasks();

    let svc_state = Arc::clone(&state);
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = Arc::clone(&svc_state);
        let remote_addr = conn.remote_addr();

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(Arc::clone(&state), req, remote_addr)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                futures::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        });

    info!(
        "Log stream <{}> listening on http://{}{}/",
        stream_name, addr, API_PREFIX
    );
    let outcome = server.await.context("Server error");

    state.shutdown(tasks).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_of() {
        assert_eq!(endpoint_of("/aegis/log/save-log"), Some("save-log"));
        assert_eq!(endpoint_of("/aegis/log/details/"), Some("details"));
        assert_eq!(endpoint_of("/aegis/log/"), Some(""));
        assert_eq!(endpoint_of("/aegis/logx/save-log"), None);
        assert_eq!(endpoint_of("/other"), None);
    }
}
