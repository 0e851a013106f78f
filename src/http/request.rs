//! Outbound requests.
//!
//! # Responsibilities
//! - Validate method and target URL up front
//! - Hold headers with unique, case-insensitive keys
//! - Split a request into its wire head, its body and its cancel signal
//!
//! # Design Decisions
//! - Immutable once handed to the transport; only the cancel signal can
//!   change state afterwards
//! - The head is what the codec serializes; the body stays caller-owned

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::http::body::{BoxBody, Empty, Full, RequestBody};
use crate::net::Destination;
use crate::resilience::cancellation::{CancelHandle, CancelSignal};

/// Header mapping with unique keys. Keys are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing (and returning) any previous value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The serializable part of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub authority: String,
    /// Path and query.
    pub target: String,
    pub headers: Headers,
    pub content_length: Option<u64>,
}

/// An outbound request.
pub struct Request {
    method: String,
    url: Url,
    headers: Headers,
    content_length: Option<u64>,
    body: BoxBody,
    cancel: CancelSignal,
}

impl Request {
    /// Create a request with an empty body and no deadline.
    pub fn new(method: &str, url: &str) -> TransportResult<Self> {
        if !is_token(method) {
            return Err(TransportError::InvalidRequest(format!(
                "invalid method '{}'",
                method
            )));
        }
        let url = Url::parse(url)
            .map_err(|e| TransportError::InvalidRequest(format!("invalid url '{}': {}", url, e)))?;
        if url.host_str().is_none() {
            return Err(TransportError::InvalidRequest(format!("url has no host: {}", url)));
        }
        Ok(Self {
            method: method.to_string(),
            url,
            headers: Headers::new(),
            content_length: None,
            body: Box::new(Empty),
            cancel: CancelSignal::none(),
        })
    }

    /// Shorthand for a GET request.
    pub fn get(url: &str) -> TransportResult<Self> {
        Self::new("GET", url)
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a caller-supplied body. The content length stays whatever was
    /// declared (or unknown).
    pub fn body(mut self, body: impl RequestBody) -> Self {
        self.body = Box::new(body);
        self
    }

    /// Attach an in-memory body and declare its length.
    pub fn bytes(mut self, data: impl Into<Bytes>) -> Self {
        let body = Full::new(data);
        self.content_length = Some(body.len() as u64);
        self.body = Box::new(body);
        self
    }

    /// Declare the number of body bytes the peer should expect.
    pub fn content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    /// Fail the request with `DeadlineExceeded` once `timeout` has elapsed.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.cancel = self.cancel.with_deadline(deadline);
        self
    }

    /// Fail the request with `Canceled` when `handle` is triggered.
    pub fn cancel_with(mut self, handle: &CancelHandle) -> Self {
        self.cancel = self.cancel.with_handle(handle);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Pool key for this request.
    pub fn destination(&self) -> TransportResult<Destination> {
        Destination::from_url(&self.url)
    }

    /// Split into wire head, body and cancel signal.
    pub fn into_parts(self) -> (RequestHead, BoxBody, CancelSignal) {
        let authority = match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
            None => self.url.host_str().unwrap_or_default().to_string(),
        };
        let target = match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        };
        let head = RequestHead {
            method: self.method,
            authority,
            target,
            headers: self.headers,
            content_length: self.content_length,
        };
        (head, self.body, self.cancel)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// RFC 9110 token characters.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}
