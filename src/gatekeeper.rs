//! Request screening pipeline
//!
//! Every request passes these stages in order before it reaches a handler:
//!
//! 1. maintenance gate (503)
//! 2. header policy: CORS and server identity headers, never rejects
//! 3. blacklist filter (403)
//! 4. referer check (403)
//! 5. credential check (403)
//! 6. rate limit (429)
//! 7. abuse counting, whatever the outcome of 1-6
//!
//! Stages 1-4 only look at the request head, so `screen_head` runs them
//! before the body is read and `screen` runs the whole pipeline after.
//!
//! A rejection carries the headers collected before it, so a blocked browser
//! client still gets its CORS headers.

use anyhow::{Context, Result};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::Method;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::ServerConfig;
use crate::detector::OriginCounter;
use crate::error::ServiceError;
use crate::rate_limiter::{ElasticWindowLimiter, RateLimitDecision};
use crate::store::{EntryList, StoreSet};

/// What the pipeline needs to know about a request
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Client IP
    pub origin: String,
    pub method: Method,
    pub path: String,
    pub referer: Option<String>,
    /// `Origin` request header
    pub origin_header: Option<String>,
    /// `api_key` parameter or `X-Api-Key` header
    pub api_key: Option<String>,
}

impl RequestInfo {
    pub fn new(origin: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            method,
            path: path.into(),
            referer: None,
            origin_header: None,
            api_key: None,
        }
    }

    /// Fill referer, origin and credential from request headers.
    /// `api_key_param` wins over the `X-Api-Key` header.
    pub fn with_headers(mut self, headers: &HeaderMap, api_key_param: Option<&str>) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.referer = text(header::REFERER.as_str());
        self.origin_header = text(header::ORIGIN.as_str());
        self.api_key = api_key_param
            .map(str::to_string)
            .or_else(|| text("x-api-key"));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Maintenance,
    Blacklist,
    Referer,
    Credential,
    RateLimit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Maintenance => "maintenance",
            Stage::Blacklist => "blacklist",
            Stage::Referer => "referer",
            Stage::Credential => "credential",
            Stage::RateLimit => "rate_limit",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Admission {
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct Rejection {
    pub stage: Stage,
    pub error: ServiceError,
    pub headers: HeaderMap,
}

// =============================================================================
// HEADER POLICY
// =============================================================================

/// Response headers derived from `[server]` and `[server.cors]`
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    fixed: HeaderMap,
    any_origin: bool,
    allowed_origins: Vec<String>,
    allow_credentials: bool,
}

impl HeaderPolicy {
    /// Build the policy. Fails on header names or values that are not valid HTTP.
    pub fn from_config(server: &ServerConfig) -> Result<Self> {
        let cors = &server.cors;
        let mut fixed = HeaderMap::new();

        let has_server = server.headers.keys().any(|k| k.eq_ignore_ascii_case("server"));
        if !has_server {
            fixed.insert(header::SERVER, value(&server.server_name)?);
        }
        if cors.allow_credentials {
            fixed.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if !cors.allow_headers.is_empty() {
            fixed.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value(&cors.allow_headers.join(", "))?);
        }
        if !cors.allow_methods.is_empty() {
            fixed.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value(&cors.allow_methods.join(", "))?);
        }
        fixed.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(cors.max_age));
        if !cors.expose_headers.is_empty() {
            fixed.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value(&cors.expose_headers.join(", "))?);
        }

        for (name, val) in &server.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name '{}'", name))?;
            fixed.insert(name, value(val)?);
        }

        Ok(Self {
            fixed,
            any_origin: cors.allowed_origins.iter().any(|o| o == "*"),
            allowed_origins: cors.allowed_origins.clone(),
            allow_credentials: cors.allow_credentials,
        })
    }

    /// Headers for one request
    pub fn headers_for(&self, origin_header: Option<&str>) -> HeaderMap {
        let mut headers = self.fixed.clone();

        let allow_origin = match origin_header {
            // A wildcard cannot be combined with credentials, echo instead
            Some(origin) if self.any_origin && self.allow_credentials => Some(origin),
            _ if self.any_origin => Some("*"),
            Some(origin) if self.allowed_origins.iter().any(|o| o == origin) => Some(origin),
            _ => None,
        };

        if let Some(origin) = allow_origin {
            if let Ok(v) = HeaderValue::from_str(origin) {
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
                if origin != "*" {
                    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
                }
            }
        }
        headers
    }
}

fn value(text: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(text).with_context(|| format!("Invalid header value '{}'", text))
}

// =============================================================================
// REFERER
// =============================================================================

/// `scheme://host[:port]` of a URL, or the input without trailing slashes
fn normalized_origin(text: &str) -> String {
    match url::Url::parse(text) {
        Ok(url) if url.has_host() => url.origin().ascii_serialization(),
        _ => text.trim_end_matches('/').to_string(),
    }
}

/// Whether `candidate` (a Referer or Origin value) matches the allow list
pub fn referer_allowed(allow_list: &[String], candidate: Option<&str>) -> bool {
    if allow_list.is_empty() || allow_list.iter().any(|entry| entry == "*") {
        return true;
    }
    let Some(candidate) = candidate else {
        return false;
    };
    let candidate = normalized_origin(candidate);
    allow_list
        .iter()
        .any(|entry| normalized_origin(entry) == candidate)
}

fn reject(stage: Stage, error: ServiceError, headers: HeaderMap) -> Rejection {
    Rejection {
        stage,
        error,
        headers,
    }
}

/// Constant-time membership test over the credential list
fn credential_matches(keys: &[String], presented: &str) -> bool {
    let presented = presented.as_bytes();
    keys.iter().fold(false, |found, key| {
        let eq: bool = key.as_bytes().ct_eq(presented).into();
        found | eq
    })
}

// =============================================================================
// GATEKEEPER
// =============================================================================

pub struct Gatekeeper {
    policy: HeaderPolicy,
    blacklist_filter: bool,
    referer_allow_list: Vec<String>,
    stores: StoreSet,
    limiter: Arc<ElasticWindowLimiter>,
    counter: Arc<OriginCounter>,
}

impl Gatekeeper {
    pub fn new(
        server: &ServerConfig,
        stores: StoreSet,
        limiter: Arc<ElasticWindowLimiter>,
        counter: Arc<OriginCounter>,
    ) -> Result<Self> {
        Ok(Self {
            policy: HeaderPolicy::from_config(server)?,
            blacklist_filter: server.blacklist_filter,
            referer_allow_list: server.referer_allow_list.clone(),
            stores,
            limiter,
            counter,
        })
    }

    /// Run the pipeline for one request
    pub async fn screen(&self, req: &RequestInfo) -> Result<Admission, Rejection> {
        let outcome = self.run_stages(req).await;
        self.counter.record(&req.origin);
        self.log_rejection(req, &outcome);
        outcome
    }

    /// Run only the stages that need nothing but the request head
    /// (maintenance, blacklist, referer), before the body is read.
    ///
    /// A rejection here is counted like one from `screen`. A request that
    /// passes is not counted; it still has to go through `screen`.
    pub fn screen_head(&self, req: &RequestInfo) -> Result<(), Rejection> {
        let outcome = self.head_stages(req).map(|_| ());
        if outcome.is_err() {
            self.counter.record(&req.origin);
            self.log_rejection(req, &outcome);
        }
        outcome
    }

    fn log_rejection<T>(&self, req: &RequestInfo, outcome: &Result<T, Rejection>) {
        if let Err(rejection) = outcome {
            debug!(
                "Rejected {} {} from {} at {}: {}",
                req.method, req.path, req.origin, rejection.stage, rejection.error
            );
        }
    }

    fn head_stages(&self, req: &RequestInfo) -> Result<HeaderMap, Rejection> {
        if self.stores.system.get().maintenance_mode {
            return Err(reject(Stage::Maintenance, ServiceError::Maintenance, HeaderMap::new()));
        }

        let headers = self.policy.headers_for(req.origin_header.as_deref());

        if self.blacklist_filter && self.stores.blacklist.contains(&req.origin) {
            return Err(reject(
                Stage::Blacklist,
                ServiceError::authorization("Origin is blacklisted"),
                headers,
            ));
        }

        let referer = req.referer.as_deref().or(req.origin_header.as_deref());
        if !referer_allowed(&self.referer_allow_list, referer) {
            return Err(reject(
                Stage::Referer,
                ServiceError::authorization("Referer not allowed"),
                headers,
            ));
        }
        Ok(headers)
    }

    async fn run_stages(&self, req: &RequestInfo) -> Result<Admission, Rejection> {
        let headers = self.head_stages(req)?;

        let keys = self.stores.credentials.get();
        if !keys.is_empty() {
            let valid = req
                .api_key
                .as_deref()
                .map(|key| credential_matches(keys.entries(), key))
                .unwrap_or(false);
            if !valid {
                return Err(reject(
                    Stage::Credential,
                    ServiceError::authorization("Invalid API key"),
                    headers,
                ));
            }
        }

        match self.limiter.hit(&req.origin).await {
            RateLimitDecision::Allowed { .. } => Ok(Admission { headers }),
            RateLimitDecision::Denied { retry_after_secs, .. } => Err(reject(
                Stage::RateLimit,
                ServiceError::RateLimited { retry_after_secs },
                headers,
            )),
        }
    }
}
