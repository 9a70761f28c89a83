//! Per-request logging state.
//!
//! A [`RequestScope`] is created when a request enters the middleware and lives
//! until the response body has been fully written (or dropped). It owns the
//! [`ResponseObserver`] and guarantees that exactly one access record is emitted,
//! whichever way the request ends.

use axum::body::Body;
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::body::ObservedBody;
use crate::latency::format_latency;
use crate::recovery::{internal_error_response, RecoveredPanic};
use crate::{
    FieldValue, LogRecord, RecordLevel, RecordSink, RequestInfo, RequestLoggerConfig,
    ResponseObserver,
};

pub(crate) struct RequestScope {
    config: Arc<RequestLoggerConfig>,
    sink: Arc<dyn RecordSink>,
    request: RequestInfo,
    request_id: Option<String>,
    started: Instant,
    observer: ResponseObserver,
    emitted: bool,
}

impl RequestScope {
    pub(crate) fn begin(
        config: Arc<RequestLoggerConfig>,
        sink: Arc<dyn RecordSink>,
        request: RequestInfo,
        request_id: Option<String>,
    ) -> Self {
        Self {
            config,
            sink,
            request,
            request_id,
            started: Instant::now(),
            observer: ResponseObserver::new(),
            emitted: false,
        }
    }

    pub(crate) fn observer_mut(&mut self) -> &mut ResponseObserver {
        &mut self.observer
    }

    /// Record the response head and hand the body over to an [`ObservedBody`]
    /// that finishes this scope when the body ends.
    pub(crate) fn observe(mut self, response: Response) -> Response {
        let (parts, body) = response.into_parts();
        self.observer.write_header(parts.status);
        Response::from_parts(parts, Body::new(ObservedBody::new(body, self)))
    }

    /// Report a panic raised by the handler and answer with a generic 500.
    pub(crate) fn recover(self, panic: RecoveredPanic) -> Response {
        self.report_panic(&panic);
        self.observe(internal_error_response())
    }

    /// Report a recovered panic through the diagnostic stream or as an error record.
    pub(crate) fn report_panic(&self, panic: &RecoveredPanic) {
        if self.config.print_stack_trace_on_panic {
            if let Err(e) = self.config.diagnostics.write_stack(panic) {
                error!(error = %e, panic = %panic.payload, "Failed to write stack trace");
            }
            return;
        }

        let mut record = LogRecord::new(RecordLevel::Error, "log system error");
        if self.config.log_type_enabled() {
            record.fields.insert("type".into(), "error".into());
        }
        if let Some(id) = &self.request_id {
            record.fields.insert("request_id".into(), id.as_str().into());
        }
        record
            .fields
            .insert("recover_info".into(), panic.payload.as_str().into());
        if let Some(location) = &panic.location {
            record
                .fields
                .insert("panic_location".into(), location.as_str().into());
        }
        record
            .fields
            .insert("debug_stack".into(), panic.stack.to_string().into());
        self.sink.emit(record);
    }

    /// Emit the access record. Only the first call has any effect.
    pub(crate) fn finish(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let latency = format_latency(self.started.elapsed());
        debug!(status = self.observer.status(), latency = %latency, "Request finished");

        let mut record = LogRecord::new(RecordLevel::Info, self.config.message.as_str());
        record.fields = self.config.fields.evaluate(&self.observer, &self.request);
        if self.config.log_type_enabled() {
            record
                .fields
                .insert("type".into(), self.config.log_type_name.as_str().into());
        }
        if let Some(id) = &self.request_id {
            record.fields.insert("request_id".into(), id.as_str().into());
        }
        record
            .fields
            .insert("latency".into(), FieldValue::Str(latency));
        self.sink.emit(record);
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.finish();
    }
}
