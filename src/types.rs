//! Data types shared by the middleware, the field extractors and the record sinks.
//!
//! This module contains the request snapshot handed to extractors, the values
//! extractors produce, and the records delivered to a [`RecordSink`](crate::RecordSink).

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, Method, Uri, Version};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// Raw remote address of the peer, as reported by the server.
///
/// Servers that do not use axum's [`ConnectInfo`] (or proxies that know the real
/// client address) can insert this extension into the request before it reaches
/// the middleware. It takes precedence over `ConnectInfo<SocketAddr>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Read-only snapshot of the incoming request.
///
/// Taken when the request enters the middleware, so extractors can still look at
/// it after the downstream service has consumed the request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Request URI including path and query
    pub uri: Uri,
    /// Protocol version
    pub version: Version,
    /// Request headers
    pub headers: HeaderMap,
    /// Remote peer address, usually `ip:port`; empty when unknown
    pub remote_addr: String,
}

impl RequestInfo {
    /// Snapshot the parts of `request` the extractors need.
    pub fn from_request(request: &Request) -> Self {
        let extensions = request.extensions();
        let remote_addr = if let Some(RemoteAddr(addr)) = extensions.get::<RemoteAddr>() {
            addr.clone()
        } else if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
            addr.to_string()
        } else {
            String::new()
        };

        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            remote_addr,
        }
    }

    /// Protocol string such as `HTTP/1.1` or `HTTP/2.0`.
    pub fn proto(&self) -> String {
        format!("{:?}", self.version)
    }

    /// First value of header `name`, or `""` when absent or not printable.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }
}

/// A single log attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl FieldValue {
    /// Marker substituted for a field whose extractor failed.
    pub fn extraction_failed(reason: impl fmt::Display) -> Self {
        FieldValue::Str(format!("!ERROR: {reason}"))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Int(n) => write!(f, "{n}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_owned())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u16> for FieldValue {
    fn from(value: u16) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLevel {
    /// Access records
    Info,
    /// Recovered panics
    Error,
}

/// A structured record produced by the middleware.
///
/// Access records are [`RecordLevel::Info`]; the panic diagnostics emitted when
/// stack traces are not printed to the diagnostic stream are [`RecordLevel::Error`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: RecordLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl LogRecord {
    pub(crate) fn new(level: RecordLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
