//! Panic recovery support.
//!
//! Converts a caught panic payload into a [`RecoveredPanic`], provides the
//! [`DiagnosticStream`] raw stack traces are written to, and builds the generic
//! `500 Internal Server Error` response returned to the client.
//!
//! By the time `catch_unwind` returns, the panicking frames are gone. A panic
//! hook (installed once by [`RequestLoggerLayer::new`](crate::RequestLoggerLayer::new))
//! records the stack and location on the panicking thread, and
//! [`RecoveredPanic::capture`] picks them up from there.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};
use std::panic;
use std::sync::{Arc, Mutex, Once, PoisonError};

/// Body sent to the client when a handler panics. No internal details.
pub const INTERNAL_ERROR_TEXT: &str = "Internal Server Error";

/// Stack and location seen by the panic hook.
struct PanicSite {
    message: String,
    stack: Backtrace,
    location: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Install the hook that remembers where the last panic on each thread was raised.
///
/// The previously installed hook still runs afterwards. Safe to call many times.
pub(crate) fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let site = PanicSite {
                message: panic_message(info.payload()),
                stack: Backtrace::force_capture(),
                location: info.location().map(ToString::to_string),
            };
            // The slot is gone while the thread is being torn down.
            let _ = LAST_PANIC.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(site);
                }
            });
            previous(info);
        }));
    });
}

fn take_panic_site() -> Option<PanicSite> {
    LAST_PANIC
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}

/// A panic intercepted by the middleware.
#[derive(Debug)]
pub struct RecoveredPanic {
    /// The panic message, or a placeholder for non-string payloads
    pub payload: String,
    /// Stack of the panicking thread
    pub stack: Backtrace,
    /// `file:line:column` where the panic was raised, when known
    pub location: Option<String>,
}

impl RecoveredPanic {
    /// Build from a payload returned by `catch_unwind` on the panicking thread.
    ///
    /// Uses the stack recorded by the panic hook when it belongs to this
    /// payload, otherwise captures the current stack.
    pub fn capture(payload: Box<dyn Any + Send>) -> Self {
        let payload = panic_message(payload.as_ref());
        match take_panic_site() {
            Some(site) if site.message == payload => Self {
                payload,
                stack: site.stack,
                location: site.location,
            },
            _ => Self {
                payload,
                stack: Backtrace::force_capture(),
                location: None,
            },
        }
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

/// Side channel that raw stack traces are written to.
///
/// Defaults to the process's standard error. Inject any writer to capture or
/// redirect the traces.
///
/// # Examples
///
/// ```rust
/// use accesslog::DiagnosticStream;
///
/// let stream = DiagnosticStream::new(std::io::sink());
/// let stderr = DiagnosticStream::default();
/// ```
#[derive(Clone)]
pub struct DiagnosticStream {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl DiagnosticStream {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Write the panic message followed by its stack trace.
    pub fn write_stack(&self, panic: &RecoveredPanic) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "panic: {}", panic.payload)?;
        if let Some(location) = &panic.location {
            writeln!(writer, "at {location}")?;
        }
        writeln!(writer, "{}", panic.stack)?;
        writer.flush()
    }
}

impl Default for DiagnosticStream {
    fn default() -> Self {
        Self::stderr()
    }
}

impl fmt::Debug for DiagnosticStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticStream").finish_non_exhaustive()
    }
}

pub(crate) fn internal_error_response() -> Response {
    let mut response = Response::new(Body::from(INTERNAL_ERROR_TEXT));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
