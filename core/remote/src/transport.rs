//! Remote transport trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

use synceddb_common::{Error, Result};

/// HTTP-style method of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read one record or the whole collection.
    Get,
    /// Create a record or run a batched sync.
    Post,
    /// Update a record.
    Put,
    /// Delete a record.
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Whether requests with this method carry a body.
    pub fn can_have_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote call: method, path relative to the base URL, query
/// parameters and an optional JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    /// Create a request without query or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Append a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body. Ignored for methods that carry no body.
    pub fn with_body(mut self, body: Value) -> Self {
        if self.method.can_have_body() {
            self.body = Some(body);
        }
        self
    }

    /// Look up a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        for (i, (k, v)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, k, v)?;
        }
        Ok(())
    }
}

/// Status and decoded JSON body of a remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl RemoteResponse {
    /// Create a response without body.
    pub fn new(status: u16) -> Self {
        Self { status, body: None }
    }

    /// 200 with a JSON body.
    pub fn ok(body: Value) -> Self {
        Self::new(200).with_body(body)
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the remote reports the resource as absent.
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Decode the body into `T`.
    ///
    /// # Errors
    /// - `Decode` if the body is missing or does not match `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| Error::Decode("response has no body".to_string()))?;
        serde_json::from_value(body).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Turn a non-success response into an error.
    pub fn into_error(self) -> Error {
        let message = match self.body {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Error::Remote {
            status: self.status,
            message,
        }
    }
}

/// Network leg of the sync engine.
///
/// Implementations perform exactly one call per `send` and keep no state
/// between calls. `Err` is reserved for calls that produced no response at
/// all (unreachable host, broken connection). Every HTTP status, including
/// 4xx/5xx, comes back as `Ok`, with a non-JSON body kept as a string.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "http", "mock").
    fn name(&self) -> &str;

    /// Issue one call.
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse>;
}
