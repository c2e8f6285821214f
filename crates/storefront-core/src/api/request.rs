use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

/// Per-call extras layered on top of what the client adds itself
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// One logical call and how many times it has been sent after a 401.
///
/// Never mutated: a retry is a new value with the counter bumped, so the
/// caller's request can't be marked behind its back.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    method: Method,
    path: String,
    body: Option<Value>,
    options: RequestOptions,
    attempt: u32,
}

impl PendingRequest {
    pub fn new(method: Method, path: &str, body: Option<Value>, options: RequestOptions) -> Self {
        Self {
            method,
            path: path.to_string(),
            body,
            options,
            attempt: 0,
        }
    }

    /// The same call, marked as the retry after a refresh
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }
}
