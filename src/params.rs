//! Request parameters
//!
//! Parameters come from the query string, then from the body: an
//! `application/x-www-form-urlencoded` form or a JSON object. Body values
//! override query values with the same name.

use hyper::body::HttpBody;
use hyper::Body;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::ServiceError;

/// Read a request body, refusing anything larger than `limit` bytes
pub async fn read_body_limited(mut body: Body, limit: usize) -> Result<Vec<u8>, ServiceError> {
    let mut result = Vec::new();

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ServiceError::validation(format!("Error reading body: {}", e)))?;
        if result.len() + chunk.len() > limit {
            return Err(ServiceError::validation(format!(
                "Request body size exceeds maximum allowed {} bytes",
                limit
            )));
        }
        result.extend_from_slice(&chunk);
    }

    Ok(result)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: HashMap<String, Value>,
}

impl Params {
    pub fn from_query(query: &str) -> Self {
        let values = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Self { values }
    }

    /// Merge body parameters over the current ones
    pub fn merge_body(&mut self, content_type: Option<&str>, body: &[u8]) -> Result<(), ServiceError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());

        match mime.as_deref() {
            Some("application/x-www-form-urlencoded") => {
                for (k, v) in url::form_urlencoded::parse(body).into_owned() {
                    self.values.insert(k, Value::String(v));
                }
                Ok(())
            }
            Some("application/json") => {
                let object = parse_json_object(body)
                    .ok_or_else(|| ServiceError::validation("Body must be a JSON object"))?;
                self.values.extend(object);
                Ok(())
            }
            // Clients that omit the content type usually send JSON
            None => {
                if let Some(object) = parse_json_object(body) {
                    self.values.extend(object);
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value of `key`; non-string values are ignored
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[cfg(test)]
    pub fn insert(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}

fn parse_json_object(body: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
