//! Default record sink backed by `tracing`.
//!
//! This module provides [`TracingSink`], which forwards every record to the
//! `tracing` subscriber installed by the application. It serves as both the
//! usual production sink and an example of how to implement [`RecordSink`].

use std::collections::BTreeMap;
use tracing::Level;

use crate::{FieldValue, LogRecord, RecordLevel, RecordSink};

/// [`RecordSink`] that emits records as `tracing` events.
///
/// Events use the `accesslog` target. Access records are `INFO`, recovered
/// panics are `ERROR`. The attributes the middleware itself produces become
/// typed event fields:
/// - `status`, `bytes_in`, `bytes_out` as integers
/// - `latency`, `remote_ip`, `url`, `proto`, `method`, `user_agent`,
///   `request_id`, `recover_info`, `panic_location`, `debug_stack` as strings
/// - `log_type` for the `type` attribute (`type` is a Rust keyword)
///
/// Event fields must be known at compile time, so any other field (those
/// registered by the application, or a built-in replaced with a value of a
/// different kind) is collected into a single `fields` JSON object string.
/// The event also carries `timestamp`, the RFC 3339 time the record was created,
/// and uses the record message as its message.
///
/// # Examples
///
/// ```rust
/// use accesslog::{RequestLoggerLayer, RequestLoggerConfig, TracingSink};
///
/// let layer = RequestLoggerLayer::new(RequestLoggerConfig::default(), TracingSink);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

/// A record split into typed event fields and the JSON rest.
struct EventFields {
    timestamp: String,
    message: String,
    log_type: Option<String>,
    request_id: Option<String>,
    latency: Option<String>,
    remote_ip: Option<String>,
    url: Option<String>,
    proto: Option<String>,
    method: Option<String>,
    user_agent: Option<String>,
    status: Option<i64>,
    bytes_in: Option<i64>,
    bytes_out: Option<i64>,
    recover_info: Option<String>,
    panic_location: Option<String>,
    debug_stack: Option<String>,
    custom: Option<String>,
}

impl EventFields {
    fn from_record(record: LogRecord) -> Self {
        let mut fields = record.fields;
        let mut event = Self {
            timestamp: record.timestamp.to_rfc3339(),
            message: record.message,
            log_type: take_str(&mut fields, "type"),
            request_id: take_str(&mut fields, "request_id"),
            latency: take_str(&mut fields, "latency"),
            remote_ip: take_str(&mut fields, "remote_ip"),
            url: take_str(&mut fields, "url"),
            proto: take_str(&mut fields, "proto"),
            method: take_str(&mut fields, "method"),
            user_agent: take_str(&mut fields, "user_agent"),
            status: take_int(&mut fields, "status"),
            bytes_in: take_int(&mut fields, "bytes_in"),
            bytes_out: take_int(&mut fields, "bytes_out"),
            recover_info: take_str(&mut fields, "recover_info"),
            panic_location: take_str(&mut fields, "panic_location"),
            debug_stack: take_str(&mut fields, "debug_stack"),
            custom: None,
        };
        if !fields.is_empty() {
            event.custom = Some(match serde_json::to_string(&fields) {
                Ok(json) => json,
                Err(_) => format!("{fields:?}"),
            });
        }
        event
    }
}

fn take_str(fields: &mut BTreeMap<String, FieldValue>, name: &str) -> Option<String> {
    match fields.remove(name) {
        Some(FieldValue::Str(value)) => Some(value),
        Some(other) => {
            fields.insert(name.to_owned(), other);
            None
        }
        None => None,
    }
}

fn take_int(fields: &mut BTreeMap<String, FieldValue>, name: &str) -> Option<i64> {
    match fields.remove(name) {
        Some(FieldValue::Int(value)) => Some(value),
        Some(other) => {
            fields.insert(name.to_owned(), other);
            None
        }
        None => None,
    }
}

macro_rules! record_event {
    ($level:expr, $event:ident) => {
        tracing::event!(
            target: "accesslog",
            $level,
            timestamp = %$event.timestamp,
            log_type = $event.log_type.as_deref(),
            request_id = $event.request_id.as_deref(),
            latency = $event.latency.as_deref(),
            remote_ip = $event.remote_ip.as_deref(),
            url = $event.url.as_deref(),
            proto = $event.proto.as_deref(),
            method = $event.method.as_deref(),
            user_agent = $event.user_agent.as_deref(),
            status = $event.status,
            bytes_in = $event.bytes_in,
            bytes_out = $event.bytes_out,
            recover_info = $event.recover_info.as_deref(),
            panic_location = $event.panic_location.as_deref(),
            debug_stack = $event.debug_stack.as_deref(),
            fields = $event.custom.as_deref(),
            "{}",
            $event.message
        )
    };
}

impl RecordSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let level = record.level;
        let event = EventFields::from_record(record);
        match level {
            RecordLevel::Info => record_event!(Level::INFO, event),
            RecordLevel::Error => record_event!(Level::ERROR, event),
        }
    }
}
