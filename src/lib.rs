//! # accesslog
//!
//! An Axum middleware that writes one structured access record per request and
//! keeps a panicking handler from taking the server down with it.
//!
//! ## Features
//!
//! - **One record per request**: timing, status, byte counts and request metadata,
//!   emitted once the response body has been fully written
//! - **Panic recovery**: a panicking handler becomes a `500 Internal Server Error`
//!   plus a diagnostic stack trace, and the access record is still written
//! - **Extensible fields**: register named extractors to add your own attributes
//! - **Pluggable output**: records go to `tracing` by default, or to any [`RecordSink`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use accesslog::{RequestLoggerConfig, RequestLoggerLayer, RequestInfo, ResponseObserver, TracingSink};
//! use accesslog::fields::FieldRegistry;
//! use axum::{routing::get, Router};
//!
//! async fn hello() -> &'static str {
//!     "Hello, World!"
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     tracing_subscriber::fmt().init();
//!
//!     let config = RequestLoggerConfig {
//!         fields: FieldRegistry::default()
//!             .with("shard_id", |_: &ResponseObserver, _: &RequestInfo| "A"),
//!         ..Default::default()
//!     };
//!
//!     let app = Router::new()
//!         .route("/hello", get(hello))
//!         .layer(RequestLoggerLayer::new(config, TracingSink));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Custom Sinks
//!
//! Implement the [`RecordSink`] trait to send records somewhere else:
//!
//! ```rust
//! use accesslog::{LogRecord, RecordSink};
//!
//! #[derive(Debug)]
//! struct StdoutSink;
//!
//! impl RecordSink for StdoutSink {
//!     fn emit(&self, record: LogRecord) {
//!         println!("{} {:?}", record.message, record.fields);
//!     }
//! }
//! ```

use axum::{extract::Request, response::Response};
use futures::FutureExt;
use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::SystemTime,
};
use tower::{Layer, Service};
use tracing::{debug, instrument};

pub mod types;
pub use types::{FieldValue, LogRecord, RecordLevel, RemoteAddr, RequestInfo};

pub mod observer;
pub use observer::ResponseObserver;

pub mod fields;
use fields::FieldRegistry;

pub mod recovery;
pub use recovery::{DiagnosticStream, RecoveredPanic};

pub mod latency;

pub mod tracing_sink;
pub use tracing_sink::TracingSink;

mod body;
mod scope;
use scope::RequestScope;

#[cfg(test)]
pub(crate) mod test_support;

/// Global atomic counter for request IDs and process start timestamp
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static PROCESS_START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

/// Generate a unique request ID combining process start time and counter
fn generate_request_id() -> String {
    let start_time = *PROCESS_START_TIME.get_or_init(|| {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });

    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);

    // High 32 bits: process start timestamp, Low 32 bits: counter
    format!("{:016x}", (start_time << 32) | (counter & 0xFFFFFFFF))
}

/// Configuration for the request logging middleware.
///
/// Built once when the layer is created and shared read-only by every request.
///
/// # Examples
///
/// ```rust
/// use accesslog::RequestLoggerConfig;
///
/// // Default configuration
/// let config = RequestLoggerConfig::default();
///
/// // Custom configuration
/// let config = RequestLoggerConfig {
///     message: "http_request".to_string(),
///     print_stack_trace_on_panic: false,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct RequestLoggerConfig {
    /// Message of every access record
    pub message: String,
    /// Value of the `type` attribute; empty disables the attribute
    pub log_type_name: String,
    /// Whether to add the `type` attribute at all
    pub include_log_type: bool,
    /// Write panic stack traces to `diagnostics` instead of emitting an error record
    pub print_stack_trace_on_panic: bool,
    /// Add a `request_id` attribute shared by the access record and any panic record
    pub include_request_id: bool,
    /// Fields evaluated for every access record
    pub fields: FieldRegistry,
    /// Where raw stack traces are written
    pub diagnostics: DiagnosticStream,
}

impl RequestLoggerConfig {
    pub(crate) fn log_type_enabled(&self) -> bool {
        self.include_log_type && !self.log_type_name.is_empty()
    }
}

impl Default for RequestLoggerConfig {
    fn default() -> Self {
        Self {
            message: "incoming_request".to_string(),
            log_type_name: "access".to_string(),
            include_log_type: true,
            print_stack_trace_on_panic: true,
            include_request_id: false,
            fields: FieldRegistry::default(),
            diagnostics: DiagnosticStream::default(),
        }
    }
}

/// Destination of the records produced by the middleware.
///
/// Called synchronously from the request path: once per request with the access
/// record, and once per recovered panic with an error record when stack traces
/// are not printed to the diagnostic stream.
///
/// # Examples
///
/// ```rust
/// use accesslog::{LogRecord, RecordSink};
/// use std::sync::Mutex;
///
/// #[derive(Debug, Default)]
/// struct Collector(Mutex<Vec<LogRecord>>);
///
/// impl RecordSink for Collector {
///     fn emit(&self, record: LogRecord) {
///         self.0.lock().unwrap().push(record);
///     }
/// }
/// ```
pub trait RecordSink: Send + Sync + 'static {
    /// Handle one record.
    fn emit(&self, record: LogRecord);
}

impl<K: RecordSink + ?Sized> RecordSink for Arc<K> {
    fn emit(&self, record: LogRecord) {
        (**self).emit(record)
    }
}

/// Tower layer for the request logging middleware.
///
/// This is the main entry point. It implements the Tower [`Layer`] trait and can
/// be used with Axum's layering system.
///
/// # Examples
///
/// ```rust,no_run
/// use accesslog::{RequestLoggerLayer, RequestLoggerConfig, TracingSink};
/// use axum::{routing::get, Router};
/// use tower::ServiceBuilder;
///
/// # async fn hello() -> &'static str { "Hello" }
/// # #[tokio::main]
/// # async fn main() {
/// let layer = RequestLoggerLayer::new(RequestLoggerConfig::default(), TracingSink);
///
/// let app = Router::new()
///     .route("/hello", get(hello))
///     .layer(ServiceBuilder::new().layer(layer));
///
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
/// axum::serve(listener, app).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct RequestLoggerLayer {
    config: Arc<RequestLoggerConfig>,
    sink: Arc<dyn RecordSink>,
}

impl RequestLoggerLayer {
    /// Create a new request logger layer with the given configuration and sink.
    ///
    /// The first call installs a process-wide panic hook that records the stack
    /// of a panicking thread before it unwinds. Any hook set earlier keeps running.
    pub fn new<K: RecordSink>(config: RequestLoggerConfig, sink: K) -> Self {
        recovery::install_panic_hook();
        Self {
            config: Arc::new(config),
            sink: Arc::new(sink),
        }
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggerService {
            inner,
            config: self.config.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Tower service implementation for the request logging middleware.
///
/// Wraps an inner service, times it, recovers its panics and observes the
/// response body as it streams out. The access record is emitted when the body
/// has been fully written, fails, or is dropped.
///
/// Users typically don't interact with this type directly - it's created by [`RequestLoggerLayer`].
#[derive(Clone)]
pub struct RequestLoggerService<S> {
    inner: S,
    config: Arc<RequestLoggerConfig>,
    sink: Arc<dyn RecordSink>,
}

impl<S> Service<Request> for RequestLoggerService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        let request_id = self.config.include_request_id.then(generate_request_id);
        let info = RequestInfo::from_request(&request);
        debug!(method = %info.method, uri = %info.uri, "Starting request processing");

        let scope = RequestScope::begin(self.config.clone(), self.sink.clone(), info, request_id);

        // A panic can surface either while building the future or while polling it.
        let called = panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(request)));

        Box::pin(async move {
            let outcome = match called {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(payload) => Err(payload),
            };

            match outcome {
                Ok(Ok(response)) => {
                    debug!(status = %response.status(), "Inner service response received");
                    Ok(scope.observe(response))
                }
                Ok(Err(e)) => {
                    debug!("Inner service returned an error");
                    drop(scope);
                    Err(e)
                }
                Err(payload) => {
                    let recovered = RecoveredPanic::capture(payload);
                    debug!(panic = %recovered.payload, "Recovered panic from inner service");
                    Ok(scope.recover(recovered))
                }
            }
        })
    }
}
