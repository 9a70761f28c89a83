//! Named field extractors for access records.
//!
//! A [`FieldRegistry`] maps field names to [`FieldExtractor`]s. Each extractor
//! computes one attribute from the finished response and the request snapshot.
//! The default registry carries the built-in fields:
//! `remote_ip`, `url`, `proto`, `method`, `user_agent`, `status`, `bytes_in`
//! and `bytes_out`.
//!
//! # Examples
//!
//! ```rust
//! use accesslog::fields::FieldRegistry;
//! use accesslog::{RequestInfo, ResponseObserver};
//!
//! let fields = FieldRegistry::default()
//!     .with("shard_id", |_: &ResponseObserver, _: &RequestInfo| "A")
//!     .with("has_query", |_: &ResponseObserver, r: &RequestInfo| r.uri.query().is_some());
//!
//! assert!(fields.contains("shard_id"));
//! assert!(fields.contains("remote_ip"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use crate::recovery::panic_message;
use crate::{FieldValue, RequestInfo, ResponseObserver};

/// Error returned by a fallible [`FieldExtractor`].
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("missing {0}")]
    Missing(String),
    #[error("{0}")]
    Other(String),
}

/// Error splitting a remote address into host and port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("address {0}: missing port in address")]
    MissingPort(String),
    #[error("address {0}: too many colons in address")]
    TooManyColons(String),
    #[error("address {0}: missing ']' in address")]
    MissingBracket(String),
    #[error("address {0}: unexpected '[' in address")]
    UnexpectedOpenBracket(String),
    #[error("address {0}: unexpected ']' in address")]
    UnexpectedCloseBracket(String),
}

/// Computes one named attribute of an access record.
///
/// Any `Fn(&ResponseObserver, &RequestInfo) -> impl Into<FieldValue>` is an
/// extractor. Implement the trait directly when extraction can fail; a failing
/// extractor only affects its own field.
pub trait FieldExtractor: Send + Sync + 'static {
    fn extract(
        &self,
        response: &ResponseObserver,
        request: &RequestInfo,
    ) -> Result<FieldValue, ExtractError>;
}

impl<F, V> FieldExtractor for F
where
    F: Fn(&ResponseObserver, &RequestInfo) -> V + Send + Sync + 'static,
    V: Into<FieldValue>,
{
    fn extract(
        &self,
        response: &ResponseObserver,
        request: &RequestInfo,
    ) -> Result<FieldValue, ExtractError> {
        Ok(self(response, request).into())
    }
}

/// Name → extractor mapping evaluated once per request.
///
/// Names are unique; registering a name twice keeps the last extractor.
/// Cloning is cheap, extractors are shared.
#[derive(Clone)]
pub struct FieldRegistry {
    extractors: BTreeMap<String, Arc<dyn FieldExtractor>>,
}

impl FieldRegistry {
    /// A registry without any fields, not even the built-ins.
    pub fn empty() -> Self {
        Self {
            extractors: BTreeMap::new(),
        }
    }

    /// Add a field. Returns self for builder pattern.
    pub fn with<E: FieldExtractor>(mut self, name: impl Into<String>, extractor: E) -> Self {
        self.insert(name, extractor);
        self
    }

    /// Add a field, replacing any extractor already registered under `name`.
    ///
    /// The middleware writes `latency` (and `type`/`request_id` when enabled)
    /// after the registry is evaluated, replacing fields registered under the
    /// same names.
    pub fn insert<E: FieldExtractor>(&mut self, name: impl Into<String>, extractor: E) {
        self.extractors.insert(name.into(), Arc::new(extractor));
    }

    /// Remove a field. Returns true if it was registered.
    pub fn remove(&mut self, name: &str) -> bool {
        self.extractors.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extractors.contains_key(name)
    }

    /// Registered field names, in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.extractors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Run every extractor against the finished response and request.
    ///
    /// An extractor that errors or panics yields
    /// [`FieldValue::extraction_failed`] for its field; the other fields are
    /// unaffected.
    pub fn evaluate(
        &self,
        response: &ResponseObserver,
        request: &RequestInfo,
    ) -> BTreeMap<String, FieldValue> {
        self.extractors
            .iter()
            .map(|(name, extractor)| {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(response, request)));
                let value = match outcome {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => {
                        warn!(field = %name, error = %e, "Field extractor failed");
                        FieldValue::extraction_failed(e)
                    }
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        warn!(field = %name, panic = %reason, "Field extractor panicked");
                        FieldValue::extraction_failed(reason)
                    }
                };
                (name.clone(), value)
            })
            .collect()
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::empty()
            .with("remote_ip", remote_ip)
            .with("url", url)
            .with("proto", proto)
            .with("method", method)
            .with("user_agent", user_agent)
            .with("status", status)
            .with("bytes_in", bytes_in)
            .with("bytes_out", bytes_out)
    }
}

impl fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Remote IP with the port stripped.
///
/// When the address contains a colon but cannot be split, the error is logged
/// and the raw address is returned.
pub fn remote_ip(_: &ResponseObserver, request: &RequestInfo) -> String {
    let addr = &request.remote_addr;
    if !addr.contains(':') {
        return addr.clone();
    }
    match split_host_port(addr) {
        Ok((host, _)) => host.to_owned(),
        Err(e) => {
            error!(error = %e, "could not parse remote address");
            addr.clone()
        }
    }
}

pub fn url(_: &ResponseObserver, request: &RequestInfo) -> String {
    request.uri.path().to_owned()
}

pub fn proto(_: &ResponseObserver, request: &RequestInfo) -> String {
    request.proto()
}

pub fn method(_: &ResponseObserver, request: &RequestInfo) -> String {
    request.method.as_str().to_owned()
}

pub fn user_agent(_: &ResponseObserver, request: &RequestInfo) -> String {
    request.header("user-agent").to_owned()
}

pub fn status(response: &ResponseObserver, _: &RequestInfo) -> u16 {
    response.status()
}

/// Raw `Content-Length` header, not parsed.
pub fn bytes_in(_: &ResponseObserver, request: &RequestInfo) -> String {
    request.header("content-length").to_owned()
}

pub fn bytes_out(response: &ResponseObserver, _: &RequestInfo) -> u64 {
    response.bytes_written()
}

/// Split `host:port` or `[host]:port` into host and port.
pub fn split_host_port(addr: &str) -> Result<(&str, &str), AddrError> {
    let Some(last_colon) = addr.rfind(':') else {
        return Err(AddrError::MissingPort(addr.to_owned()));
    };

    let (host, open, close) = if addr.starts_with('[') {
        let Some(end) = addr.find(']') else {
            return Err(AddrError::MissingBracket(addr.to_owned()));
        };
        if end + 1 == addr.len() {
            return Err(AddrError::MissingPort(addr.to_owned()));
        }
        if end + 1 != last_colon {
            // Either "[host]junk:port" or "[host]" followed by another colon.
            return if addr.as_bytes()[end + 1] == b':' {
                Err(AddrError::TooManyColons(addr.to_owned()))
            } else {
                Err(AddrError::MissingPort(addr.to_owned()))
            };
        }
        (&addr[1..end], 1, end + 1)
    } else {
        let host = &addr[..last_colon];
        if host.contains(':') {
            return Err(AddrError::TooManyColons(addr.to_owned()));
        }
        (host, 0, 0)
    };

    if addr[open..].contains('[') {
        return Err(AddrError::UnexpectedOpenBracket(addr.to_owned()));
    }
    if addr[close..].contains(']') {
        return Err(AddrError::UnexpectedCloseBracket(addr.to_owned()));
    }

    Ok((host, &addr[last_colon + 1..]))
}
