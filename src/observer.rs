//! Request-scoped response observation.
//!
//! [`ResponseObserver`] tracks the status code and the number of body bytes that
//! went out for one response. It is fed by [`ObservedBody`](crate::body::ObservedBody)
//! and read by the field extractors once the response has finished.

use axum::http::StatusCode;

/// Status code and byte count of a single response, as seen on the wire.
///
/// The first status written is authoritative: later calls to
/// [`write_header`](Self::write_header) are ignored. Writing body bytes before
/// any status implies `200 OK`.
///
/// # Examples
///
/// ```rust
/// use accesslog::ResponseObserver;
/// use axum::http::StatusCode;
///
/// let mut observer = ResponseObserver::new();
/// assert_eq!(observer.status(), 0);
///
/// observer.write_header(StatusCode::CREATED);
/// observer.write_header(StatusCode::INTERNAL_SERVER_ERROR);
/// observer.record_write(5);
///
/// assert_eq!(observer.status(), 201);
/// assert_eq!(observer.bytes_written(), 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseObserver {
    status: Option<StatusCode>,
    bytes_written: u64,
}

impl ResponseObserver {
    /// Create an observer with no status and no bytes recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` unless a status has already been recorded.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    /// Record a body write of `len` bytes.
    pub fn record_write(&mut self, len: usize) {
        self.write_header(StatusCode::OK);
        self.bytes_written = self.bytes_written.saturating_add(len as u64);
    }

    /// The recorded status code, or `0` when no response has been produced.
    pub fn status(&self) -> u16 {
        self.status.map_or(0, |status| status.as_u16())
    }

    /// Total body bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
